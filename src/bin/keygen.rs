//! Identity key generation tool.
//!
//! Creates an Ed25519 identity for a peer or a discovery server and
//! writes it to disk, optionally sealed with a passphrase:
//!
//!   cargo run --bin keygen -- --output ~/.config/acip/identity.key
//!
//! The printed public key is what session hosts publish out of band
//! (for example behind the HTTPS URL handed to --acds-key-url).

use acip::crypto::Identity;
use acip::policy;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "ACIP identity key generator")]
struct Args {
    /// Where to write the key file
    #[arg(short, long)]
    output: PathBuf,

    /// Seal the key with the passphrase from ASCII_CHAT_KEY_PASSWORD
    #[arg(long)]
    sealed: bool,

    /// Overwrite an existing key file
    #[arg(long)]
    force: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("acip=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    if args.output.exists() && !args.force {
        eprintln!(
            "refusing to overwrite {:?} (use --force to replace it)",
            args.output
        );
        std::process::exit(acip::types::exit_code::CONFIG_INVALID);
    }

    let passphrase = if args.sealed {
        match policy::Policy::key_password() {
            Some(p) => Some(p),
            None => {
                eprintln!(
                    "--sealed needs a passphrase in {}",
                    policy::ENV_KEY_PASSWORD
                );
                std::process::exit(acip::types::exit_code::CONFIG_INVALID);
            }
        }
    } else {
        None
    };

    let identity = Identity::generate();
    if let Err(e) = identity.save(&args.output, passphrase.as_deref()) {
        eprintln!("failed to write key: {e}");
        std::process::exit(acip::types::exit_code::FAILURE);
    }

    println!("identity written to {:?}", args.output);
    println!("public key: {}", hex::encode(identity.public_bytes()));
    println!("fingerprint: {}", identity.fingerprint());
}
