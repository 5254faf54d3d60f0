/*!
 * Remote helper dispatch
 *
 * Every remote capability is one invocation of the helper program:
 *
 * ```text
 * <program> <subcommand> <database> <out file> [extra args...]
 * ```
 *
 * The helper prints exactly one line starting with `SUCCESS:` or `ERROR:`.
 * That line is the only success signal; exit codes are not trusted. Data
 * exports leave a binary file at `<out file>` which is pulled over SCP and
 * decoded. The out file is removed afterwards whatever the outcome.
 */

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use shell_escape::unix::escape;
use skyrun_core_wire::{
    decode_series_batch, decode_structure, encode_request_args, SeriesBatch, StructureEntry,
};
use tracing::{debug, info, warn};

use crate::config::HelperConfig;
use crate::error::{RemoteError, Result};
use crate::remote::RemoteSession;

/// Status line prefix for a successful helper run
pub const SUCCESS_MARKER: &str = "SUCCESS:";

/// Status line prefix for a failed helper run
pub const ERROR_MARKER: &str = "ERROR:";

/// Message used when the helper printed no status line at all
pub const NO_STATUS_MESSAGE: &str = "no status line in helper output";

/// Helper sub-commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperCommand {
    ExportStructure,
    ExportValues,
    CreateParameterDatabase,
    ExportParameters,
    Run,
}

impl HelperCommand {
    /// Keyword understood by the helper
    pub fn keyword(&self) -> &'static str {
        match self {
            HelperCommand::ExportStructure => "export_structure",
            HelperCommand::ExportValues => "export_values",
            HelperCommand::CreateParameterDatabase => "create_parameter_database",
            HelperCommand::ExportParameters => "export_parameters",
            HelperCommand::Run => "run",
        }
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Classify helper output by its status line
///
/// Returns the text after `SUCCESS:` on success. An `ERROR:` line anywhere
/// wins over a success line, and output with neither marker is a failure.
pub fn classify_status(output: &str) -> Result<String> {
    let mut success = None;

    for line in output.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix(ERROR_MARKER) {
            return Err(RemoteError::RemoteOperation {
                message: rest.trim().to_string(),
            });
        }
        if success.is_none() {
            if let Some(rest) = line.strip_prefix(SUCCESS_MARKER) {
                success = Some(rest.trim().to_string());
            }
        }
    }

    success.ok_or_else(|| RemoteError::RemoteOperation {
        message: NO_STATUS_MESSAGE.to_string(),
    })
}

fn quote(arg: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(arg))
}

/// Builds helper command lines and runs them on a session
#[derive(Debug)]
pub struct Dispatcher {
    helper: HelperConfig,
    sequence: AtomicU64,
}

impl Dispatcher {
    pub fn new(helper: HelperConfig) -> Self {
        Self {
            helper,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn helper(&self) -> &HelperConfig {
        &self.helper
    }

    /// Fresh remote path for one request's output file
    pub fn temp_path(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!("skyrun_{}_{}.bin", std::process::id(), n);
        format!("{}/{}", self.helper.temp_dir.trim_end_matches('/'), name)
    }

    /// Build the full command line for one helper invocation
    pub fn build_command(&self, command: HelperCommand, out_file: &str, args: &[String]) -> String {
        let mut parts = vec![
            quote(&self.helper.program),
            Cow::Borrowed(command.keyword()),
            quote(&self.helper.database),
            quote(out_file),
        ];
        parts.extend(args.iter().map(|a| quote(a)));
        parts.join(" ")
    }

    /// Export a structure tree from `table`
    pub fn export_structure<S>(&self, session: &mut S, table: &str) -> Result<Vec<StructureEntry>>
    where
        S: RemoteSession + ?Sized,
    {
        let args = encode_request_args(table, &[]);
        let bytes = self.invoke(session, HelperCommand::ExportStructure, &args, true)?;
        let entries = decode_structure(&bytes)?;
        debug!(table, entries = entries.len(), "structure exported");
        Ok(entries)
    }

    /// Export the series for `ids` from `table`
    ///
    /// The decoded batch holds exactly one series per requested ID.
    pub fn export_values<S>(&self, session: &mut S, table: &str, ids: &[u32]) -> Result<SeriesBatch>
    where
        S: RemoteSession + ?Sized,
    {
        let args = encode_request_args(table, ids);
        let bytes = self.invoke(session, HelperCommand::ExportValues, &args, true)?;
        let batch = decode_series_batch(&bytes, ids.len())?;
        debug!(table, series = batch.series.len(), "values exported");
        Ok(batch)
    }

    /// Build the model's parameter database from an input file
    pub fn create_parameter_store<S>(
        &self,
        session: &mut S,
        exe_name: &str,
        input_file: &str,
    ) -> Result<()>
    where
        S: RemoteSession + ?Sized,
    {
        let args = vec![exe_name.to_string(), input_file.to_string()];
        self.invoke(session, HelperCommand::CreateParameterDatabase, &args, false)?;
        Ok(())
    }

    /// Write the model's parameters back to its input format
    pub fn export_parameters<S>(&self, session: &mut S, exe_name: &str) -> Result<()>
    where
        S: RemoteSession + ?Sized,
    {
        let args = vec![exe_name.to_string()];
        self.invoke(session, HelperCommand::ExportParameters, &args, false)?;
        Ok(())
    }

    /// Start a model run
    ///
    /// Stale output databases are removed first. Only a failure to execute
    /// the command is reported; what the helper says about the simulation
    /// itself is logged and otherwise ignored. If the removal fails, the old
    /// outputs may survive into the next run.
    pub fn run_model<S>(
        &self,
        session: &mut S,
        exe_name: &str,
        input_file: &str,
        db_name: &str,
    ) -> Result<()>
    where
        S: RemoteSession + ?Sized,
    {
        if !self.helper.run_outputs.is_empty() {
            let targets: Vec<_> = self.helper.run_outputs.iter().map(|p| quote(p)).collect();
            let command = format!("rm -f {}", targets.join(" "));
            if let Err(e) = session.execute(&command, None) {
                warn!(error = %e, "failed to remove previous run outputs");
            }
        }

        let out_file = self.temp_path();
        let args = vec![
            exe_name.to_string(),
            input_file.to_string(),
            db_name.to_string(),
        ];
        let command = self.build_command(HelperCommand::Run, &out_file, &args);

        let result = session.execute(&command, None);
        self.remove_temp(session, &out_file);
        let output = result?;

        match classify_status(&output.text) {
            Ok(message) => info!(exe_name, %message, "model run finished"),
            Err(e) => warn!(exe_name, error = %e, "model run reported a problem"),
        }
        Ok(())
    }

    /// Run one helper sub-command; with `fetch`, pull and return its out file
    fn invoke<S>(
        &self,
        session: &mut S,
        command: HelperCommand,
        args: &[String],
        fetch: bool,
    ) -> Result<Vec<u8>>
    where
        S: RemoteSession + ?Sized,
    {
        let out_file = self.temp_path();
        let line = self.build_command(command, &out_file, args);
        debug!(%command, %line, "invoking helper");

        let result = session
            .execute(&line, None)
            .and_then(|output| classify_status(&output.text))
            .and_then(|message| {
                debug!(%command, %message, "helper succeeded");
                if fetch {
                    session.pull(&out_file)
                } else {
                    Ok(Vec::new())
                }
            });

        self.remove_temp(session, &out_file);
        result
    }

    /// Best-effort removal of a remote temp file
    fn remove_temp<S>(&self, session: &mut S, path: &str)
    where
        S: RemoteSession + ?Sized,
    {
        let command = format!("rm -f {}", quote(path));
        if let Err(e) = session.execute(&command, None) {
            warn!(path, error = %e, "failed to remove remote temp file");
        }
    }
}
