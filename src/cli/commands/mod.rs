pub mod auth;
pub mod logging;
pub mod oidc;
pub mod proxy;
pub mod security;

use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::{
        BoolishValueParser,
        styling::{AnsiColor, Effects, Styles},
    },
};

pub const ARG_PORT: &str = "port";
pub const ARG_DATA_DIR: &str = "data-dir";
pub const ARG_HOSTED: &str = "hosted";
pub const ARG_MULTI_TENANT: &str = "multi-tenant";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("pulse")
        .about("Authentication and tenant authorization gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("7655")
                .env("PULSE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DATA_DIR)
                .long(ARG_DATA_DIR)
                .help("Directory holding sessions, tokens, audit logs and org data")
                .default_value("/etc/pulse")
                .env("PULSE_DATA_PATH"),
        )
        .arg(
            Arg::new(ARG_HOSTED)
                .long(ARG_HOSTED)
                .help("Hosted mode, never issues a bootstrap token")
                .env("PULSE_HOSTED_MODE")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new(ARG_MULTI_TENANT)
                .long(ARG_MULTI_TENANT)
                .help("Serve organizations other than the default one")
                .env("PULSE_MULTI_TENANT_ENABLED")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        );

    let command = auth::with_args(command);
    let command = proxy::with_args(command);
    let command = oidc::with_args(command);
    let command = security::with_args(command);
    logging::with_args(command)
}
