//! End-to-end tests for building and running command lines.

use ikura::command_line::{CommandLine, ParametersList};

#[cfg(unix)]
use ikura::console::{ConsoleLevel, ConsoleSource};
#[cfg(unix)]
use ikura::env::ParentEnvironment;
#[cfg(unix)]
use ikura::handler::{HandlerOptions, ProcessHandler};
#[cfg(unix)]
use std::time::Duration;

#[test]
fn display_form_round_trips_through_parse() {
    let cl = CommandLine::new("/bin/echo").with_parameters(["a b", "c\"d", ""]);
    let rendered = cl.command_line_string();
    let parsed = ParametersList::parse(&rendered);
    assert_eq!(parsed[0], "/bin/echo");
    assert_eq!(&parsed[1..], ["a b", "c\"d", ""]);
}

#[cfg(unix)]
#[tokio::test]
async fn child_sees_work_directory_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let cl = CommandLine::new("/bin/sh")
        .with_parameter("-c")
        .with_parameter("echo marker:$IKURA_MARKER; pwd")
        .with_work_directory(dir.path())
        .with_parent_environment(ParentEnvironment::System)
        .with_environment_var("IKURA_MARKER", "present");

    let child = cl.create_process().await.unwrap();
    let output = child.wait_with_output().await.unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("marker:present"), "stdout was: {}", stdout);
    let pwd_line = stdout.lines().last().unwrap();
    assert_eq!(
        std::fs::canonicalize(pwd_line).unwrap(),
        std::fs::canonicalize(dir.path()).unwrap()
    );
}

#[cfg(unix)]
#[tokio::test]
async fn parent_environment_none_gives_a_clean_slate() {
    let cl = CommandLine::new("/usr/bin/env")
        .with_parent_environment(ParentEnvironment::None)
        .with_environment_var("ONLY_ONE", "yes");

    let child = cl.create_process().await.unwrap();
    let output = child.wait_with_output().await.unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["ONLY_ONE=yes"]);
}

#[cfg(unix)]
#[tokio::test]
async fn arguments_reach_the_child_verbatim() {
    // quoting belongs to the display forms only; spawning must pass
    // arguments through untouched
    let cl = CommandLine::new("/usr/bin/printf")
        .with_parameter("%s\n")
        .with_parameter("has space")
        .with_parameter("quo\"te");

    let child = cl.create_process().await.unwrap();
    let output = child.wait_with_output().await.unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout, "has space\nquo\"te\n");
}

#[cfg(unix)]
#[tokio::test]
async fn level_pattern_classifies_the_console() {
    let cl = CommandLine::new("/bin/sh")
        .with_parameter("-c")
        .with_parameter("echo '[INFO] ready'; echo '[ERROR] kaboom'; echo plain");
    let options = HandlerOptions {
        level_pattern: Some(r"^\[(?P<level>[A-Z]+)\]".to_string()),
        ..Default::default()
    };

    let handler = ProcessHandler::spawn_with_options(&cl, options).await.unwrap();
    handler.wait_for_exit().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let lines = handler.recent_console(50).await;
    let level_of = |content: &str| {
        lines
            .iter()
            .find(|l| l.content == content)
            .map(|l| l.level)
            .unwrap()
    };
    assert_eq!(level_of("[INFO] ready"), ConsoleLevel::Info);
    assert_eq!(level_of("[ERROR] kaboom"), ConsoleLevel::Error);
    assert_eq!(level_of("plain"), ConsoleLevel::Info);
    assert!(lines.iter().all(|l| l.content != "plain" || l.source == ConsoleSource::Stdout));
}

#[cfg(unix)]
#[tokio::test]
async fn shell_parent_environment_launches_successfully() {
    // the default mode consults the login shell; the launch must still work
    // and the child must end up with a PATH
    let cl = CommandLine::new("/bin/sh")
        .with_parameter("-c")
        .with_parameter("test -n \"$PATH\"");
    let child = cl.create_process().await.unwrap();
    let output = child.wait_with_output().await.unwrap();
    assert!(output.status.success());
}
