// UI layer: session startup and the line-oriented menu loop.
// Input and output are passed in so the same code runs against a terminal
// and against scripted input in tests. Storage and ledger access come in as
// explicit dependencies; nothing here is process-global.

use crate::config::{
    self, ConfigStore, Settings, CONTRACT_ADDR, CONTRACT_BIN, DEFAULT_IPFS, GATEWAY, KEY, KEYPASS,
};
use crate::error::{Error, Result};
use crate::ledger::{format_address, Ledger, RpcClient};
use crate::registry::{identity_bytecode, parse_bytecode, AcademicRecord, Session};
use crate::storage::{ContentStore, IpfsClient};
use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const NETWORK: &str = "Network ::";
pub const IPFS: &str = "IPFS ::";
pub const CONTRACT: &str = "Contract ::";
pub const CLIENT: &str = "Client ::";

const MENU: &str = "Pick an option:\n\
                    1. setAcademicDetails.\n\
                    2. getAcademicDetails.\n\
                    3. Exit.\n\
                    4. Reset and exit.\n";

/// How the menu loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Option 3, or end of input
    Exit,
    /// Option 4: contract address cleared
    Reset,
}

/// Print a status line with a highlighted prefix.
pub fn say<W: Write>(out: &mut W, prefix: &str, message: &str) -> io::Result<()> {
    writeln!(out, "{} {}", prefix.bold().green(), message)
}

fn complain<W: Write>(out: &mut W, prefix: &str, message: &str) -> io::Result<()> {
    writeln!(out, "{} {}", prefix.bold().red(), message)
}

/// Run `f` with a spinner on stderr. The spinner is hidden when stderr is
/// not a terminal.
fn with_spinner<T>(message: &str, f: impl FnOnce() -> T) -> T {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    let result = f();
    spinner.finish_and_clear();
    result
}

/// Read one line, without its line ending. `None` at end of input.
/// Other whitespace is kept: student ids are compared byte for byte.
fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn prompt<R: BufRead, W: Write>(input: &mut R, out: &mut W, label: &str) -> Result<Option<String>> {
    say(out, CLIENT, label)?;
    out.flush()?;
    read_line(input)
}

/// Bound registry session plus the storage client and configuration it
/// needs to serve the menu.
pub struct Controller<S, L> {
    store: S,
    session: Session<L>,
    config: ConfigStore,
}

/// Fail with a connection error unless the storage node answers.
pub fn check_storage<S: ContentStore>(store: &S, address: &str) -> Result<()> {
    if store.is_reachable() {
        Ok(())
    } else {
        Err(Error::Connection(format!("IPFS node at {} is unreachable", address)))
    }
}

/// Reach both nodes: the ledger at `GATEWAY`, then the IPFS node at `IPFS`.
/// Either failing is fatal.
pub fn connect<W: Write>(settings: &Settings, out: &mut W) -> Result<(RpcClient, IpfsClient)> {
    let ledger = RpcClient::connect(settings.get(GATEWAY))?;
    say(out, NETWORK, "Successfully connected")?;

    let address = settings.get_or(config::IPFS, DEFAULT_IPFS);
    let ipfs = IpfsClient::new(address)?;
    check_storage(&ipfs, address)?;
    say(out, IPFS, "Successfully connected")?;
    Ok((ledger, ipfs))
}

/// Bytecode to deploy: the file named by `CONTRACTBIN` when set, otherwise
/// the registry built into the binary.
fn deployment_bytecode(settings: &Settings) -> Result<Vec<u8>> {
    let bin_path = settings.get(CONTRACT_BIN);
    if bin_path.is_empty() {
        return identity_bytecode();
    }
    let text = fs::read_to_string(bin_path)
        .map_err(|e| Error::Deploy(format!("cannot read bytecode {}: {}", bin_path, e)))?;
    parse_bytecode(&text)
}

/// Create the session and bind it to a registry contract.
///
/// With no `CONTRACTADDR` configured a new contract is deployed and its
/// address persisted; otherwise the configured address is loaded. Every
/// failure here is fatal for the caller.
pub fn start<S, L, W>(
    config: ConfigStore,
    settings: &Settings,
    ledger: L,
    store: S,
    out: &mut W,
) -> Result<Controller<S, L>>
where
    S: ContentStore,
    L: Ledger,
    W: Write,
{
    let mut session = Session::new(ledger, settings.get(KEY), settings.get(KEYPASS))?;
    info!(address = %format_address(&session.address()), "Session created");

    let configured = settings.get(CONTRACT_ADDR);
    if configured.is_empty() {
        say(out, CONTRACT, "Deploying new contract")?;
        let bytecode = deployment_bytecode(settings)?;

        let deployment = with_spinner("Submitting deployment...", || session.deploy(&bytecode))?;
        let address = format_address(&deployment.address);
        say(
            out,
            CONTRACT,
            &format!(
                "Contract deployment submitted at {}. Wait for tx {} to be confirmed.",
                address, deployment.transaction
            ),
        )?;
        config.update(CONTRACT_ADDR, &address)?;
    } else {
        say(out, CONTRACT, "Loading existing contract")?;
        session.load(configured)?;
    }

    Ok(Controller {
        store,
        session,
        config,
    })
}

impl<S: ContentStore, L: Ledger> Controller<S, L> {
    pub fn session(&self) -> &Session<L> {
        &self.session
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Release the ledger connection.
    pub fn close(self) {
        self.session.into_ledger().close();
    }

    /// Serve the menu until the user exits, resets, or input ends.
    ///
    /// Failures of a single action are reported and the menu is shown again;
    /// only fatal errors and I/O errors on the menu itself end the loop.
    pub fn run<R: BufRead, W: Write>(&self, input: &mut R, out: &mut W) -> Result<Outcome> {
        loop {
            write!(out, "{}", MENU)?;
            out.flush()?;

            let Some(choice) = read_line(input)? else {
                say(out, CLIENT, "Exiting")?;
                return Ok(Outcome::Exit);
            };

            let result = match choice.trim() {
                "1" => self.set_academic_details(input, out),
                "2" => self.get_academic_details(input, out),
                "3" => {
                    say(out, CLIENT, "Exiting")?;
                    return Ok(Outcome::Exit);
                }
                "4" => {
                    self.config.update(CONTRACT_ADDR, "")?;
                    say(out, CLIENT, "Cleared contract address. Exiting")?;
                    return Ok(Outcome::Reset);
                }
                _ => {
                    complain(out, CLIENT, "Invalid option. Please try again.")?;
                    Ok(())
                }
            };

            match result {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(option = %choice, error = %e, "Menu action failed");
                    complain(out, CLIENT, &e.to_string())?;
                }
                Ok(()) => {}
            }
        }
    }

    /// Upload a directory and record its identifier under a student id.
    fn set_academic_details<R: BufRead, W: Write>(&self, input: &mut R, out: &mut W) -> Result<()> {
        let Some(student_id) = prompt(input, out, "Enter studentId")? else {
            return Ok(());
        };
        let Some(source) = prompt(input, out, "Enter sourcePath")? else {
            return Ok(());
        };

        let cid = with_spinner("Uploading to IPFS...", || {
            self.store.upload_directory(Path::new(&source))
        })?;
        say(out, IPFS, &format!("Successfully uploaded to IPFS ({})", cid))?;

        let record = AcademicRecord::new(cid.as_str());
        let pending = with_spinner("Submitting transaction...", || {
            self.session.set_record(&student_id, &record)
        })?;
        say(
            out,
            CONTRACT,
            &format!(
                "Academic details submitted. Please wait for tx {} to be confirmed.",
                pending
            ),
        )?;
        Ok(())
    }

    /// Look up a student's record and download the files it points to.
    fn get_academic_details<R: BufRead, W: Write>(&self, input: &mut R, out: &mut W) -> Result<()> {
        let Some(student_id) = prompt(input, out, "Enter studentId")? else {
            return Ok(());
        };

        let record = self.session.get_record(&student_id)?;
        if record.is_empty() {
            say(
                out,
                CONTRACT,
                &format!("No academic details recorded for {}", student_id),
            )?;
            return Ok(());
        }
        say(
            out,
            CONTRACT,
            &format!("Successfully got academic details ({})", record.degree_id),
        )?;

        let Some(target) = prompt(input, out, "Enter targetPath")? else {
            return Ok(());
        };
        with_spinner("Downloading from IPFS...", || {
            self.store.download(&record.content_id(), Path::new(&target))
        })?;
        say(out, IPFS, "Successfully downloaded from IPFS")?;
        Ok(())
    }
}
