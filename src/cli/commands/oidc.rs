use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, builder::BoolishValueParser};
use secrecy::SecretString;

pub const ARG_OIDC_ENABLED: &str = "oidc-enabled";
pub const ARG_OIDC_ISSUER_URL: &str = "oidc-issuer-url";
pub const ARG_OIDC_TOKEN_URL: &str = "oidc-token-url";
pub const ARG_OIDC_CLIENT_ID: &str = "oidc-client-id";
pub const ARG_OIDC_CLIENT_SECRET: &str = "oidc-client-secret";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OIDC_ENABLED)
                .long(ARG_OIDC_ENABLED)
                .help("Accept OIDC sessions and refresh their tokens")
                .env("PULSE_OIDC_ENABLED")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new(ARG_OIDC_ISSUER_URL)
                .long(ARG_OIDC_ISSUER_URL)
                .help("Issuer URL recorded on OIDC sessions")
                .env("PULSE_OIDC_ISSUER_URL"),
        )
        .arg(
            Arg::new(ARG_OIDC_TOKEN_URL)
                .long(ARG_OIDC_TOKEN_URL)
                .help("Token endpoint used for refresh_token grants")
                .env("PULSE_OIDC_TOKEN_URL"),
        )
        .arg(
            Arg::new(ARG_OIDC_CLIENT_ID)
                .long(ARG_OIDC_CLIENT_ID)
                .help("OIDC client ID")
                .env("PULSE_OIDC_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_OIDC_CLIENT_SECRET)
                .long(ARG_OIDC_CLIENT_SECRET)
                .help("OIDC client secret")
                .env("PULSE_OIDC_CLIENT_SECRET")
                .hide_env_values(true),
        )
}

#[derive(Debug)]
pub struct Client {
    pub issuer_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Debug)]
pub struct Options {
    pub enabled: bool,
    /// Present only when OIDC is enabled.
    pub client: Option<Client>,
}

fn required(matches: &ArgMatches, id: &str) -> Result<String> {
    matches
        .get_one::<String>(id)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("missing required argument: --{id} (OIDC is enabled)"))
}

impl Options {
    /// # Errors
    /// Returns an error if OIDC is enabled without its client settings.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        if !matches.get_flag(ARG_OIDC_ENABLED) {
            return Ok(Self {
                enabled: false,
                client: None,
            });
        }
        Ok(Self {
            enabled: true,
            client: Some(Client {
                issuer_url: required(matches, ARG_OIDC_ISSUER_URL)?,
                token_url: required(matches, ARG_OIDC_TOKEN_URL)?,
                client_id: required(matches, ARG_OIDC_CLIENT_ID)?,
                client_secret: SecretString::from(required(matches, ARG_OIDC_CLIENT_SECRET)?),
            }),
        })
    }
}
