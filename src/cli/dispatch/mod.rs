//! Map parsed CLI arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{
    ARG_DATA_DIR, ARG_HOSTED, ARG_MULTI_TENANT, ARG_PORT, auth, oidc, proxy, security,
};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(7655);
    let data_dir = matches
        .get_one::<String>(ARG_DATA_DIR)
        .map(PathBuf::from)
        .context("missing required argument: --data-dir")?;

    Ok(Action::Server(Args {
        port,
        data_dir,
        hosted: matches.get_flag(ARG_HOSTED),
        multi_tenant: matches.get_flag(ARG_MULTI_TENANT),
        auth: auth::Options::parse(matches)?,
        proxy: proxy::Options::parse(matches),
        oidc: oidc::Options::parse(matches)?,
        security: security::Options::parse(matches),
    }))
}
