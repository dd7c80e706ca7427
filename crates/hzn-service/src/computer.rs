use std::process::Stdio;

use bytes::Bytes;
use tokio::process::Command;

use hzn_types::{HznError, Location, Radius};

use crate::compute::HorizonComputer;

/// Runs an external horizon calculator once per request.
///
/// The program is invoked as `program [args..] --lat <lat> --lon <lon>
/// --radius <radius>` and must write the encoded profile to stdout. A non-zero
/// exit status is a computation error carrying the program's stderr. The child
/// is killed when the computation is cancelled, e.g. by the compute timeout.
#[derive(Debug, Clone)]
pub struct CommandComputer {
    program: String,
    args: Vec<String>,
}

impl CommandComputer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandComputer { program: program.into(), args }
    }
}

impl HorizonComputer for CommandComputer {
    async fn compute(&self, location: Location, radius: Radius) -> Result<Bytes, HznError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--lat")
            .arg(location.lat.to_string())
            .arg("--lon")
            .arg(location.lon.to_string())
            .arg("--radius")
            .arg(radius.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HznError::Compute(format!("cannot run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HznError::Compute(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        tracing::debug!(program = %self.program, bytes = output.stdout.len(), "horizon computed");
        Ok(Bytes::from(output.stdout))
    }
}
