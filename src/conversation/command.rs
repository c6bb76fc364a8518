/// A message of a user, as far as the conversation is concerned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    /// `/help` or `/start`
    Help,

    /// `/new`
    New,

    /// `/delete <id>`
    Delete(Option<&'a str>),

    /// `/get <id>`
    Get(Option<&'a str>),

    /// `/list`, or `/list -a` to include deleted notes
    List { show_deleted: bool },

    /// Any other command
    Unknown(&'a str),

    /// Plain text, input for the wizard
    Text(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(text: &'a str) -> Self {
        let text = text.trim();

        let Some(rest) = text.strip_prefix('/') else {
            return Self::Text(text);
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        // in groups commands can be addressed, `/list@some_bot`
        let name = name.split('@').next().unwrap_or(name);
        let argument = parts.next();

        match name {
            "help" | "start" => Self::Help,
            "new" => Self::New,
            "delete" => Self::Delete(argument),
            "get" => Self::Get(argument),
            "list" => Self::List {
                show_deleted: argument == Some("-a"),
            },
            _ => Self::Unknown(name),
        }
    }
}
