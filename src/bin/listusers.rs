//! List Users Tool - Shows all configured users

use anyhow::Result;
use clap::Parser;
use smtpd::config::UsersConfig;
use std::path::PathBuf;

/// List all smtpd users
#[derive(Parser, Debug)]
#[command(name = "smtpd-listusers")]
#[command(about = "List SMTP AUTH users")]
#[command(version)]
struct Args {
    /// Users file
    #[arg(short, long, default_value = "users.yaml")]
    users_file: PathBuf,

    /// Show detailed information
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let base_dir = std::env::current_dir()?;
    let users_file = if args.users_file.is_absolute() {
        args.users_file.clone()
    } else {
        base_dir.join(&args.users_file)
    };

    let users = if users_file.exists() {
        UsersConfig::from_file(&users_file)?
    } else {
        UsersConfig::default()
    };

    if users.users.is_empty() {
        println!("No users configured");
        println!("Use smtpd-adduser to add users");
        return Ok(());
    }

    println!("Users ({}):", users.users.len());
    println!("{}", "-".repeat(60));

    let mut user_list: Vec<_> = users.users.iter().collect();
    user_list.sort_by(|a, b| a.0.cmp(b.0));

    for (username, entry) in user_list {
        if args.verbose {
            println!("\n  {}:", username);
            let scheme = entry.password.split('$').next().unwrap_or_default();
            println!("    Password: {} hash", scheme);
            if entry.whitelist.is_empty() {
                println!("    Whitelist: (any IP)");
            } else {
                println!("    Whitelist: {}", entry.whitelist.join(", "));
            }
        } else {
            let whitelist_info = if entry.whitelist.is_empty() {
                String::new()
            } else {
                format!(" [{} IPs]", entry.whitelist.len())
            };
            println!("  {}{}", username, whitelist_info);
        }
    }

    if !args.verbose {
        println!();
        println!("Use -v for detailed information");
    }

    Ok(())
}
