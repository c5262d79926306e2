#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const TOGGLE_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "camera",
    action: "set_camera",
}];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "frames",
    action: "set_frames",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "mood",
        action: "show_mood",
    },
    CommandSpec {
        command: "history",
        action: "show_history",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/camera [on|off]",
    "/frames <path>",
    "/mood",
    "/history",
    "/help",
    "/quit",
];
