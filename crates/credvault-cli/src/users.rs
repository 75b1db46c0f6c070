use std::{fs, path::Path};

use chrono::Utc;
use color_eyre::Result;
use credvault_core::credential::{CredentialRecord, UserStore};

use crate::cli::UserCommand;

/// Execute a user subcommand against the given store.
pub fn handle<S: UserStore + ?Sized>(cmd: UserCommand, store: &S) -> Result<()> {
    match cmd {
        UserCommand::List => {
            let mut users = store.all_users()?;
            if users.is_empty() {
                println!("No stored users. Add one with `credvault user import <file>`.");
                return Ok(());
            }
            users.sort_by(|a, b| a.identity.cmp(&b.identity));
            for user in &users {
                println!("{}", describe(user));
            }
        }
        UserCommand::Current => match store.current()? {
            Some(user) => println!("{}", describe(&user)),
            None => println!("No user is currently logged in."),
        },
        UserCommand::Show { identity } => match store.get(&identity)? {
            Some(user) => {
                println!("{}", describe(&user));
                for realm in &user.session.realms {
                    let role = if realm.is_admin { "admin" } else { "user" };
                    println!("    {} -> {} ({role})", realm.realm_url, realm.local_path);
                }
            }
            None => println!("No readable record for {identity}."),
        },
        UserCommand::Import { path } => {
            let record = import(store, &path)?;
            println!("Stored {}", record.identity);
        }
        UserCommand::Logout { identity } => {
            logout(store, &identity)?;
            println!("Logged out {identity}");
        }
        UserCommand::Remove { identity } => {
            store.remove(&identity)?;
            println!("Removed {identity}");
        }
    }

    Ok(())
}

fn import<S: UserStore + ?Sized>(store: &S, path: &Path) -> Result<CredentialRecord> {
    let json = fs::read_to_string(path)?;
    let record = CredentialRecord::from_json(&json)?;
    if record.identity.is_empty() {
        color_eyre::eyre::bail!("record in {} has no identity", path.display());
    }
    store.put(&record)?;
    Ok(record)
}

fn logout<S: UserStore + ?Sized>(store: &S, identity: &str) -> Result<()> {
    let Some(mut record) = store.get(identity)? else {
        color_eyre::eyre::bail!("no readable record for {identity}");
    };
    record.logout();
    store.put(&record)?;
    Ok(())
}

fn describe(user: &CredentialRecord) -> String {
    let state = if user.is_valid() {
        "valid"
    } else {
        "logged out"
    };
    let expiry = match &user.session.user_token {
        Some(token) if token.is_expired_at(Utc::now()) => {
            format!("expired {}", token.expires_at.to_rfc3339())
        }
        Some(token) => format!("expires {}", token.expires_at.to_rfc3339()),
        None => "no token".to_string(),
    };
    format!(
        "{} [{state}] {} ({expiry})",
        user.identity, user.authority_url
    )
}
