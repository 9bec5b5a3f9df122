use clap::Parser;
use clap::error::ErrorKind;
use pretty_assertions::assert_eq;
use serde_json::Value;

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl boxsync::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(args: boxsync::Args) -> anyhow::Result<String> {
    let options = args.run_options(boxsync::OutputFormat::Pretty);
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let fake_args = maybe_fake_args.ok_or_else(|| anyhow::anyhow!("tests only run against the fake backend"))?;
    let mut output = Vec::new();
    boxsync::run_with_clients(
        command,
        &options,
        &mut output,
        &FakeTerminalClient,
        boxsync::fake_clients(fake_args),
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv<const N: usize>(argv: [&str; N]) -> anyhow::Result<String> {
    let parsed_args = boxsync::Args::try_parse_from(argv)?;
    run_with_parsed_args(parsed_args).await
}

fn first_json_document(stdout: &str) -> anyhow::Result<Value> {
    let line = stdout
        .lines()
        .next()
        .ok_or_else(|| anyhow::anyhow!("command printed nothing"))?;
    Ok(serde_json::from_str(line)?)
}

#[tokio::test]
async fn read_command_prints_synchronised_values() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "boxsync",
        "--fake",
        "--fake-scan",
        "00:11|Speaker|-65;AA:BB|BLEExample|-43",
        "--fake-message",
        "Hello",
        "read",
    ])
    .await?;

    assert!(stdout.contains("Device"), "{stdout}");
    assert!(stdout.contains("AA:BB"), "{stdout}");
    assert!(stdout.contains("connected"), "{stdout}");
    assert!(stdout.contains("Hello (rev 1)"), "{stdout}");
    assert!(stdout.contains("off (rev 1)"), "{stdout}");
    assert!(stdout.contains("messagetransaction"), "{stdout}");
    Ok(())
}

#[tokio::test]
async fn read_command_emits_json_snapshot() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "boxsync",
        "--fake",
        "--fake-scan",
        "AA:BB|BLEExample|-43",
        "--fake-box",
        "1",
        "--output-format",
        "json",
        "read",
    ])
    .await?;

    let snapshot = first_json_document(&stdout)?;
    assert_eq!("connected", snapshot["state"]);
    assert_eq!(true, snapshot["connection_status"]);
    assert_eq!("AA:BB", snapshot["device"]["device_id"]);
    assert_eq!("Hello", snapshot["message"]["value"]);
    assert_eq!("on", snapshot["box_value"]["value"]);
    assert_eq!(1, snapshot["box_value"]["revision"]);
    assert_eq!(2, snapshot["handles"].as_array().map_or(0, Vec::len));
    Ok(())
}

#[tokio::test]
async fn device_name_selects_another_peripheral() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "boxsync",
        "--fake",
        "--fake-scan",
        "00:11|Speaker|-65;AA:BB|BLEExample|-43",
        "--device-name",
        "Speaker",
        "--output-format",
        "json",
        "read",
    ])
    .await?;

    let snapshot = first_json_document(&stdout)?;
    assert_eq!("00:11", snapshot["device"]["device_id"]);
    Ok(())
}

#[tokio::test]
async fn set_box_command_prints_acknowledged_value() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "boxsync",
        "--fake",
        "--fake-scan",
        "AA:BB|BLEExample|-43",
        "--output-format",
        "json",
        "set-box",
        "on",
    ])
    .await?;

    let snapshot = first_json_document(&stdout)?;
    assert_eq!("on", snapshot["box_value"]["value"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn watch_command_stops_after_requested_updates() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "boxsync",
        "--fake",
        "--fake-scan",
        "AA:BB|BLEExample|-43",
        "--fake-updates",
        "message:Hi,box:1",
        "watch",
        "--max-updates",
        "2",
    ])
    .await?;

    assert!(stdout.contains("message=Hi"), "{stdout}");
    assert!(stdout.contains("box=on"), "{stdout}");
    assert!(
        stdout.trim_end().ends_with("stopped after 2 update(s): limit"),
        "{stdout}"
    );
    Ok(())
}

#[tokio::test]
async fn blocked_permission_points_to_settings() {
    let result = run_with_argv([
        "boxsync",
        "--fake",
        "--fake-scan",
        "AA:BB|BLEExample|-43",
        "--fake-permission",
        "blocked",
        "read",
    ])
    .await;

    let error = result.expect_err("blocked permission should fail the command");
    assert!(format!("{error:#}").contains("system settings"), "{error:#}");
}

#[tokio::test]
async fn missing_peripheral_reports_unable_to_connect() {
    let result = run_with_argv([
        "boxsync",
        "--fake",
        "--fake-scan",
        "00:11|Speaker|-65",
        "--scan-timeout",
        "50ms",
        "read",
    ])
    .await;

    let error = result.expect_err("scan should time out");
    let rendered = format!("{error:#}");
    assert!(rendered.contains("Unable to connect to `BLEExample`"), "{rendered}");
    assert!(rendered.contains("no matching device was found"), "{rendered}");
}

#[tokio::test]
async fn programmatic_fake_arguments_drive_a_read() -> anyhow::Result<()> {
    let fake = boxsync::FakeArgs::builder()
        .scan_fixture("AA:BB|BLEExample|-43")?
        .message("From code")
        .build();
    let options = boxsync::RunOptions::builder()
        .output_format(boxsync::OutputFormat::Json)
        .build();
    let mut output = Vec::new();

    boxsync::run_with_clients(
        boxsync::Command::Read,
        &options,
        &mut output,
        &FakeTerminalClient,
        boxsync::fake_clients(fake),
    )
    .await?;

    let snapshot = first_json_document(&String::from_utf8(output)?)?;
    assert_eq!("From code", snapshot["message"]["value"]);
    Ok(())
}

#[test]
fn set_box_rejects_unknown_values() {
    let result = boxsync::Args::try_parse_from([
        "boxsync",
        "--fake",
        "--fake-scan",
        "AA:BB|BLEExample|-43",
        "set-box",
        "maybe",
    ]);

    let error = result.expect_err("unknown box values should fail command parsing");
    assert_eq!(ErrorKind::ValueValidation, error.kind());
}

#[test]
fn invalid_scan_fixture_is_rejected() {
    let result = boxsync::FakeArgs::builder().scan_fixture("invalid-record");
    assert!(matches!(
        result,
        Err(boxsync::FixtureError::InvalidRecordFieldCount)
    ));
}
