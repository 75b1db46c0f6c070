use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition. Operator harness around the encrypted user store.
#[derive(Parser, Debug)]
#[command(
    name = "credvault",
    about = "Encrypted session-credential store backed by the OS keyring",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to `status` when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Round-trip a probe through the backing store and the envelope cipher.
    Health,
    /// Show keystore capability, cipher strategy, and lock state.
    Status,
    /// Ask the platform to unlock the keystore.
    Unlock {
        /// Poll for up to this many seconds for the unlock to complete.
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Inspect and manage stored users.
    #[command(subcommand)]
    User(UserCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// List every readable stored user.
    List,
    /// Show the single valid, logged-in user.
    Current,
    /// Show one user by identity.
    Show { identity: String },
    /// Store a credential record read from a JSON file (replaces same identity).
    Import { path: PathBuf },
    /// Drop a user's tokens but keep the record.
    Logout { identity: String },
    /// Delete a user's record.
    Remove { identity: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_status_when_missing_subcommand() {
        let cli = Cli::try_parse_from(["credvault"]).expect("parse should succeed");
        assert_eq!(cli.command, None);
    }

    #[test]
    fn parses_health_subcommand() {
        let cli = Cli::try_parse_from(["credvault", "health"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Health));
    }

    #[test]
    fn parses_unlock_with_wait() {
        let cli = Cli::try_parse_from(["credvault", "unlock", "--wait", "30"])
            .expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Unlock { wait: Some(30) }));
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli =
            Cli::try_parse_from(["credvault", "config", "init"]).expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Config(ConfigCommand::Init)));
    }

    #[test]
    fn parses_user_subcommands() {
        let cli = Cli::try_parse_from(["credvault", "user", "show", "JohnDoe"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Some(Command::User(UserCommand::Show {
                identity: "JohnDoe".into()
            }))
        );

        let cli = Cli::try_parse_from(["credvault", "user", "import", "/tmp/user.json"])
            .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Some(Command::User(UserCommand::Import {
                path: PathBuf::from("/tmp/user.json")
            }))
        );
    }
}
