// SPDX-License-Identifier: MIT

//! Continue command resolution.

use crate::{error::CommandError, manifest::Command};

/// Separator between the bridge's own arguments and the app's command.
const SEPARATOR: &str = "--";

/// The app command once the compatibility-bridge prefix is stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeLaunch {
    /// Port the app is expected to serve on.
    pub port: u16,
    /// The app's own command, with the manifest environment.
    pub command: Command,
}

/// Strip `<bridge> <port> -- ` from the front of `cmd`.
///
/// Only bridge-wrapped apps are supported, so any other shape is an error.
pub fn resolve_bridge_command(cmd: &Command, bridge_path: &str) -> Result<BridgeLaunch, CommandError> {
    let first = cmd.args.first().ok_or(CommandError::Empty)?;
    if first != bridge_path {
        return Err(CommandError::NotBridge {
            expected: bridge_path.to_string(),
            found: first.clone(),
        });
    }
    if cmd.args.len() < 4 {
        return Err(CommandError::TooFewArguments(cmd.args.len()));
    }
    let port_arg = &cmd.args[1];
    // Only plain decimal digits; `parse` alone would accept a leading '+'.
    if !port_arg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CommandError::InvalidPort(port_arg.clone()));
    }
    let port = port_arg
        .parse::<u16>()
        .map_err(|_| CommandError::InvalidPort(port_arg.clone()))?;
    if cmd.args[2] != SEPARATOR {
        return Err(CommandError::MissingSeparator(cmd.args[2].clone()));
    }
    Ok(BridgeLaunch {
        port,
        command: Command {
            args: cmd.args[3..].to_vec(),
            env: cmd.env.clone(),
        },
    })
}
