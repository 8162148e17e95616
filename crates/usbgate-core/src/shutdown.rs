//! Shutdown collaborator contract and the command-backed implementation.

use crate::config::ShutdownCfg;
use crate::error::{GateError, GateResult};
use log::{error, info, warn};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

/// Powers off the host. Once issued the action cannot be cancelled.
pub trait ShutdownAction: Send + Sync {
    fn shutdown(&self) -> GateResult<()>;
}

/// Spawns the configured power-off command without waiting for it.
///
/// Only the first call does anything; later calls return `Ok(())`.
#[derive(Debug)]
pub struct CommandShutdown {
    program: String,
    args: Vec<String>,
    dry_run: bool,
    fired: AtomicBool,
}

impl CommandShutdown {
    pub fn new(program: impl Into<String>, args: Vec<String>, dry_run: bool) -> Self {
        Self {
            program: program.into(),
            args,
            dry_run,
            fired: AtomicBool::new(false),
        }
    }

    pub fn from_config(cfg: &ShutdownCfg) -> GateResult<Self> {
        let (program, args) = cfg.command.split_first().ok_or_else(|| {
            GateError::InvalidConfig("shutdown.command must name a program".into())
        })?;
        Ok(Self::new(program.clone(), args.to_vec(), cfg.dry_run))
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ShutdownAction for CommandShutdown {
    fn shutdown(&self) -> GateResult<()> {
        if self.fired.swap(true, Ordering::SeqCst) {
            warn!("shutdown already issued; ignoring repeated request");
            return Ok(());
        }

        let command_line = self.describe();
        if self.dry_run {
            warn!("dry run: would power off host with `{command_line}`");
            return Ok(());
        }

        info!("powering off host: `{command_line}`");
        match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(_child) => Ok(()),
            Err(err) => {
                error!("failed to spawn `{command_line}`: {err}");
                Err(GateError::Shutdown(format!("{command_line}: {err}")))
            }
        }
    }
}
