// Entrypoint for the CLI application.
// - Follows a fixed startup order: configuration, ledger node, IPFS node,
//   signing identity, then deploy or load the registry contract.
// - Any startup failure ends the process with a message and exit code 1.
// - Then hands stdin/stdout to the menu loop until the user exits.

use anyhow::{Context, Result};
use dialoguer::Password;
use std::io::{self, IsTerminal};
use studentid_cli::config::{self, ConfigStore};
use studentid_cli::ledger::Signer;
use studentid_cli::ui::{self, Outcome};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(io::stderr)
        .init();

    let config_store = ConfigStore::from_env();
    let mut settings = config_store.load();
    let mut out = io::stdout();

    let (ledger, ipfs) = ui::connect(&settings, &mut out)
        .context("Network :: Unable to reach the ledger or IPFS node")?;

    // Ask for the passphrase only when the file has no KEYPASS entry at all.
    if !settings.contains(config::KEYPASS)
        && Signer::needs_passphrase(settings.get(config::KEY))
        && io::stdin().is_terminal()
    {
        let passphrase: String = Password::new().with_prompt("Key passphrase").interact()?;
        settings.set(config::KEYPASS, &passphrase);
    }

    let controller = ui::start(config_store, &settings, ledger, ipfs, &mut out)
        .context("Contract :: Unable to set up registry session")?;

    let stdin = io::stdin();
    let outcome = controller.run(&mut stdin.lock(), &mut out);
    controller.close();

    if outcome? == Outcome::Reset {
        tracing::info!("Contract address cleared; next start deploys a new registry");
    }
    Ok(())
}
