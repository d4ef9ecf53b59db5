//! Delete User Tool - Removes users from configuration

use anyhow::Result;
use clap::Parser;
use smtpd::config::UsersConfig;
use std::path::PathBuf;

/// Remove a user from smtpd
#[derive(Parser, Debug)]
#[command(name = "smtpd-deluser")]
#[command(about = "Remove an SMTP AUTH user")]
#[command(version)]
struct Args {
    /// Username to remove
    username: String,

    /// Users file
    #[arg(short, long, default_value = "users.yaml")]
    users_file: PathBuf,

    /// Do not ask for confirmation
    #[arg(short, long)]
    force: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let base_dir = std::env::current_dir()?;
    let users_file = if args.users_file.is_absolute() {
        args.users_file.clone()
    } else {
        base_dir.join(&args.users_file)
    };

    let mut users = if users_file.exists() {
        UsersConfig::from_file(&users_file)?
    } else {
        eprintln!("Error: Users file not found: {}", users_file.display());
        std::process::exit(1);
    };

    if users.get_user(&args.username).is_none() {
        eprintln!("Error: User '{}' not found", args.username);
        std::process::exit(1);
    }

    // Confirm deletion
    if !args.force {
        print!("Delete user '{}'? [y/N]: ", args.username);
        std::io::Write::flush(&mut std::io::stdout())?;
        let mut response = String::new();
        std::io::stdin().read_line(&mut response)?;
        if response.trim().to_lowercase() != "y" {
            println!("Cancelled");
            return Ok(());
        }
    }

    users.remove_user(&args.username);
    users.save_to_file(&users_file)?;
    println!("User '{}' removed", args.username);

    Ok(())
}
