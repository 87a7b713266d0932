use clap::{Arg, ArgAction, ArgMatches, Command, builder::BoolishValueParser};
use secrecy::SecretString;

pub const ARG_PROXY_SECRET: &str = "proxy-auth-secret";
pub const ARG_PROXY_USER_HEADER: &str = "proxy-auth-user-header";
pub const ARG_PROXY_ROLE_HEADER: &str = "proxy-auth-role-header";
pub const ARG_PROXY_ROLE_SEPARATOR: &str = "proxy-auth-role-separator";
pub const ARG_PROXY_ADMIN_ROLE: &str = "proxy-auth-admin-role";
pub const ARG_TRUSTED_PROXY_CIDRS: &str = "trusted-proxy-cidrs";
pub const ARG_STRICT_FORWARDED_PROTO: &str = "strict-forwarded-proto";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PROXY_SECRET)
                .long(ARG_PROXY_SECRET)
                .help("Shared secret expected in X-Proxy-Secret")
                .env("PULSE_PROXY_AUTH_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_PROXY_USER_HEADER)
                .long(ARG_PROXY_USER_HEADER)
                .help("Header carrying the authenticated user")
                .env("PULSE_PROXY_AUTH_USER_HEADER"),
        )
        .arg(
            Arg::new(ARG_PROXY_ROLE_HEADER)
                .long(ARG_PROXY_ROLE_HEADER)
                .help("Header carrying the user's roles")
                .env("PULSE_PROXY_AUTH_ROLE_HEADER"),
        )
        .arg(
            Arg::new(ARG_PROXY_ROLE_SEPARATOR)
                .long(ARG_PROXY_ROLE_SEPARATOR)
                .help("Separator between roles in the role header")
                .env("PULSE_PROXY_AUTH_ROLE_SEPARATOR")
                .default_value("|"),
        )
        .arg(
            Arg::new(ARG_PROXY_ADMIN_ROLE)
                .long(ARG_PROXY_ADMIN_ROLE)
                .help("Role that grants admin access")
                .env("PULSE_PROXY_AUTH_ADMIN_ROLE")
                .default_value("admin"),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXY_CIDRS)
                .long(ARG_TRUSTED_PROXY_CIDRS)
                .help("Comma separated IPs or CIDRs allowed to set X-Forwarded-* headers")
                .env("PULSE_TRUSTED_PROXY_CIDRS")
                .default_value(""),
        )
        .arg(
            Arg::new(ARG_STRICT_FORWARDED_PROTO)
                .long(ARG_STRICT_FORWARDED_PROTO)
                .help("Only trusted proxies may mark cookies Secure through X-Forwarded-Proto")
                .env("PULSE_STRICT_FORWARDED_PROTO")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
}

#[derive(Debug)]
pub struct Options {
    /// `None` disables proxy authentication.
    pub secret: Option<SecretString>,
    pub user_header: Option<String>,
    pub role_header: Option<String>,
    pub role_separator: String,
    pub admin_role: String,
    pub trusted_cidrs: String,
    pub strict_forwarded_proto: bool,
}

fn non_empty(matches: &ArgMatches, id: &str) -> Option<String> {
    matches
        .get_one::<String>(id)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            secret: matches
                .get_one::<String>(ARG_PROXY_SECRET)
                .filter(|secret| !secret.is_empty())
                .map(|secret| SecretString::from(secret.clone())),
            user_header: non_empty(matches, ARG_PROXY_USER_HEADER),
            role_header: non_empty(matches, ARG_PROXY_ROLE_HEADER),
            role_separator: non_empty(matches, ARG_PROXY_ROLE_SEPARATOR)
                .unwrap_or_else(|| "|".to_string()),
            admin_role: non_empty(matches, ARG_PROXY_ADMIN_ROLE)
                .unwrap_or_else(|| "admin".to_string()),
            trusted_cidrs: non_empty(matches, ARG_TRUSTED_PROXY_CIDRS).unwrap_or_default(),
            strict_forwarded_proto: matches.get_flag(ARG_STRICT_FORWARDED_PROTO),
        }
    }
}
