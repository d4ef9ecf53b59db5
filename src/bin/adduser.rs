//! Add User Tool - Creates or updates AUTH users

use anyhow::Result;
use clap::Parser;
use smtpd::config::{UserEntry, UsersConfig};
use smtpd::crypto::{generate_secret, hash_password};
use std::path::PathBuf;

/// Add a user allowed to authenticate to smtpd
#[derive(Parser, Debug)]
#[command(name = "smtpd-adduser")]
#[command(about = "Add a user for SMTP AUTH")]
#[command(version)]
struct Args {
    /// Username to add
    username: String,

    /// Password (generated if not provided)
    #[arg(short, long)]
    password: Option<String>,

    /// IP whitelist entries, addresses or CIDR ranges (can specify multiple)
    #[arg(short, long)]
    whitelist: Vec<String>,

    /// Users file
    #[arg(short, long, default_value = "users.yaml")]
    users_file: PathBuf,

    /// Replace an existing user
    #[arg(long)]
    update: bool,
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
        UsersConfig::default()
    };

    if users.get_user(&args.username).is_some() && !args.update {
        eprintln!("Error: User '{}' already exists (use --update to replace)", args.username);
        std::process::exit(1);
    }

    for entry in &args.whitelist {
        let valid = entry.parse::<std::net::IpAddr>().is_ok() || entry.parse::<ipnet::IpNet>().is_ok();
        if !valid {
            eprintln!("Error: Invalid whitelist entry: {}", entry);
            std::process::exit(1);
        }
    }

    let generated = args.password.is_none();
    let password = args.password.unwrap_or_else(generate_secret);

    users.set_user(
        args.username.clone(),
        UserEntry {
            password: hash_password(&password),
            whitelist: args.whitelist,
        },
    );
    users.save_to_file(&users_file)?;

    println!("User '{}' saved to {}", args.username, users_file.display());
    if generated {
        println!("Generated password: {}", password);
        println!("It is stored only as a hash; note it down now.");
    }

    Ok(())
}
