//! Command-line interface for the cloudigrade binary.

use clap::{Parser, Subcommand};

use crate::error::Result;
use crate::services::auth_service::AuthService;

/// Track RHEL and OpenShift usage in AWS accounts
#[derive(Parser, Debug)]
#[command(name = "cloudigrade")]
#[command(about = "Track RHEL and OpenShift usage in AWS accounts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// The command to run. Serving the API is the default.
    pub fn selected_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the HTTP API and run the periodic schedulers
    Serve,

    /// Consume the task queues and run inspection tasks
    Worker,

    /// Create a superuser account
    CreateSuperuser {
        #[arg(long)]
        username: String,

        #[arg(long, default_value = "")]
        email: String,

        /// Password (can also be set via CLOUDIGRADE_SUPERUSER_PASSWORD env var)
        #[arg(long, env = "CLOUDIGRADE_SUPERUSER_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

/// Create a superuser, failing if the username is taken.
pub async fn create_superuser(
    auth_service: &AuthService,
    username: &str,
    email: &str,
    password: &str,
) -> Result<()> {
    let user = auth_service
        .create_user(username, email, password, true)
        .await?;
    tracing::info!(user_id = %user.id, username = %user.username, "Superuser created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_is_default() {
        let cli = Cli::try_parse_from(["cloudigrade"]).unwrap();
        assert_eq!(cli.selected_command(), Command::Serve);
    }

    #[test]
    fn test_worker_command() {
        let cli = Cli::try_parse_from(["cloudigrade", "worker"]).unwrap();
        assert_eq!(cli.selected_command(), Command::Worker);
    }

    #[test]
    fn test_create_superuser_args() {
        let cli = Cli::try_parse_from([
            "cloudigrade",
            "create-superuser",
            "--username",
            "admin",
            "--password",
            "hunter2",
        ])
        .unwrap();
        assert_eq!(
            cli.selected_command(),
            Command::CreateSuperuser {
                username: "admin".into(),
                email: String::new(),
                password: "hunter2".into(),
            }
        );
    }
}
