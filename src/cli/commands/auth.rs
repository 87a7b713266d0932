use anyhow::{Result, bail};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_AUTH_USER: &str = "auth-user";
pub const ARG_AUTH_PASS: &str = "auth-pass";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_AUTH_USER)
                .long(ARG_AUTH_USER)
                .help("Local username")
                .env("PULSE_AUTH_USER")
                .requires(ARG_AUTH_PASS),
        )
        .arg(
            Arg::new(ARG_AUTH_PASS)
                .long(ARG_AUTH_PASS)
                .help("Local password as an argon2 PHC hash")
                .long_help(
                    "Local password as an argon2 PHC hash. A plain value is accepted but hashed in memory at start-up with a warning.",
                )
                .env("PULSE_AUTH_PASS")
                .hide_env_values(true)
                .requires(ARG_AUTH_USER),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session idle window in seconds")
                .env("PULSE_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub session_ttl_seconds: i64,
}

impl Options {
    /// # Errors
    /// Returns an error if the session TTL is not positive.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let session_ttl_seconds = matches
            .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
            .copied()
            .unwrap_or(86_400);
        if session_ttl_seconds <= 0 {
            bail!("--{ARG_SESSION_TTL_SECONDS} must be greater than zero");
        }
        Ok(Self {
            user: matches
                .get_one::<String>(ARG_AUTH_USER)
                .map(|user| user.trim().to_string())
                .filter(|user| !user.is_empty()),
            password: matches
                .get_one::<String>(ARG_AUTH_PASS)
                .filter(|pass| !pass.is_empty())
                .map(|pass| SecretString::from(pass.clone())),
            session_ttl_seconds,
        })
    }
}
