//! OS process table probes.
//!
//! The process handler already knows whether the child it spawned is alive.
//! These helpers answer the same question from the outside, by pid, for
//! teardown verification and for processes this crate did not start.

use sysinfo::{Pid, System};

/// True when `pid` currently exists in the OS process table.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

// sysinfo는 프로세스 테이블을 동기적으로 스캔한다.
// tokio 워커에서 그대로 부르면 런타임이 멈추므로 spawn_blocking으로 돌린다.
pub async fn pid_alive_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || pid_alive(pid))
        .await
        .unwrap_or(false)
}
