//! Certificate Generation Tool

use anyhow::Result;
use clap::Parser;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, SanType};
use std::path::PathBuf;
use std::time::Duration;

/// Generate TLS certificates for STARTTLS and implicit TLS
#[derive(Parser, Debug)]
#[command(name = "smtpd-gen-certs")]
#[command(about = "Generate a CA and a server certificate for smtpd")]
#[command(version)]
struct Args {
    /// Hostname for the certificate
    #[arg(short = 'H', long, default_value = "mail.example.com")]
    hostname: String,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Validity in days
    #[arg(short, long, default_value = "365")]
    days: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Generating TLS certificates for: {}", args.hostname);
    println!("Output directory: {}", args.output.display());

    std::fs::create_dir_all(&args.output)?;

    let not_before = time::OffsetDateTime::now_utc();
    let not_after = not_before + Duration::from_secs(args.days * 24 * 60 * 60);

    // CA certificate
    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params.distinguished_name.push(DnType::OrganizationName, "smtpd");
    ca_params.distinguished_name.push(DnType::CommonName, "smtpd CA");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;

    let ca_cert = Certificate::from_params(ca_params)?;

    // Server certificate, signed by the CA
    let mut server_params = CertificateParams::new(vec![args.hostname.clone()]);
    server_params.distinguished_name = DistinguishedName::new();
    server_params.distinguished_name.push(DnType::OrganizationName, "smtpd");
    server_params.distinguished_name.push(DnType::CommonName, &args.hostname);
    server_params.subject_alt_names = vec![
        SanType::DnsName(args.hostname.clone()),
        SanType::DnsName("localhost".to_string()),
    ];
    server_params.not_before = not_before;
    server_params.not_after = not_after;
    server_params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ];
    server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let server_cert = Certificate::from_params(server_params)?;

    let ca_cert_path = args.output.join("ca.crt");
    let server_cert_path = args.output.join("server.crt");
    let server_key_path = args.output.join("server.key");

    let ca_pem = ca_cert.serialize_pem()?;
    let server_pem = server_cert.serialize_pem_with_signer(&ca_cert)?;
    let server_key_pem = server_cert.serialize_private_key_pem();

    std::fs::write(&ca_cert_path, ca_pem)?;
    std::fs::write(&server_cert_path, server_pem)?;
    std::fs::write(&server_key_path, server_key_pem)?;

    println!();
    println!("Generated certificates:");
    println!("  CA Certificate: {}", ca_cert_path.display());
    println!("  Server Certificate: {}", server_cert_path.display());
    println!("  Server Key: {}", server_key_path.display());
    println!();
    println!("Point cert_file and key_file in config.yaml at the server files.");
    println!("Clients that should verify the server need ca.crt.");

    Ok(())
}
