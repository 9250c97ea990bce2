//! Small helpers shared by the process-spawning modules.

use tokio::process::Command;

/// Apply platform-specific creation flags before a child process is spawned.
/// On Windows this sets `CREATE_NO_WINDOW` so console children do not pop up
/// a console window of their own; elsewhere it is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_spawn_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_spawn_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Milliseconds since the Unix epoch, used to timestamp console lines.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent_and_ordered() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // sometime after 2020
    }
}
