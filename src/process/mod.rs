mod registry;

pub use registry::{ProcessInfo, ProcessRegistry};

use tokio::process::Command;

/// Run a command line through the platform shell, the way the interactive
/// tools expect to be launched.
pub(crate) fn shell_command(command: &str) -> Command {
    #[cfg(target_os = "windows")]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
    #[cfg(not(target_os = "windows"))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}
