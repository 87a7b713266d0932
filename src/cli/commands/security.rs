use clap::{Arg, ArgAction, ArgMatches, Command, builder::BoolishValueParser};

pub const ARG_ALLOW_EMBEDDING: &str = "allow-embedding";
pub const ARG_ALLOWED_EMBED_ORIGINS: &str = "allowed-embed-origins";
pub const ARG_AUDIT_PERSISTENT: &str = "audit-persistent";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ALLOW_EMBEDDING)
                .long(ARG_ALLOW_EMBEDDING)
                .help("Allow the UI to be framed by the listed origins")
                .env("PULSE_ALLOW_EMBEDDING")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new(ARG_ALLOWED_EMBED_ORIGINS)
                .long(ARG_ALLOWED_EMBED_ORIGINS)
                .help("Comma separated origins allowed to frame the UI")
                .env("PULSE_ALLOWED_EMBED_ORIGINS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_AUDIT_PERSISTENT)
                .long(ARG_AUDIT_PERSISTENT)
                .help("Write signed audit logs per organization")
                .env("PULSE_AUDIT_PERSISTENT")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
}

#[derive(Debug, Default)]
pub struct Options {
    pub allow_embedding: bool,
    pub allowed_embed_origins: Vec<String>,
    pub audit_persistent: bool,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            allow_embedding: matches.get_flag(ARG_ALLOW_EMBEDDING),
            allowed_embed_origins: matches
                .get_many::<String>(ARG_ALLOWED_EMBED_ORIGINS)
                .map(|origins| {
                    origins
                        .map(|origin| origin.trim().to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            audit_persistent: matches.get_flag(ARG_AUDIT_PERSISTENT),
        }
    }
}
