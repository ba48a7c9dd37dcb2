//! CLI parse tests.

use super::{Cli, CliCommand};
use clap::Parser;
use std::path::Path;

fn parse(args: &[&str]) -> CliCommand {
    let cli = Cli::try_parse_from(args).unwrap();
    cli.command
}

#[test]
fn cli_parse_add() {
    match parse(&["ketch", "add", "https://example.com/file.iso"]) {
        CliCommand::Add { url, download_dir, connections } => {
            assert_eq!(url, "https://example.com/file.iso");
            assert!(download_dir.is_none());
            assert!(connections.is_none());
        }
        _ => panic!("expected Add"),
    }
}

#[test]
fn cli_parse_add_download_dir_and_connections() {
    match parse(&["ketch", "add", "https://example.com/x", "--download-dir", "/tmp", "--connections", "8"]) {
        CliCommand::Add { url, download_dir, connections } => {
            assert_eq!(url, "https://example.com/x");
            assert_eq!(download_dir.as_deref(), Some(Path::new("/tmp")));
            assert_eq!(connections, Some(8));
        }
        _ => panic!("expected Add with --download-dir --connections"),
    }
}

#[test]
fn cli_parse_run() {
    match parse(&["ketch", "run"]) {
        CliCommand::Run => {}
        _ => panic!("expected Run"),
    }
}

#[test]
fn cli_parse_status() {
    match parse(&["ketch", "status"]) {
        CliCommand::Status => {}
        _ => panic!("expected Status"),
    }
}

#[test]
fn cli_parse_pause() {
    match parse(&["ketch", "pause", "a1b2c3"]) {
        CliCommand::Pause { id } => assert_eq!(id, "a1b2c3"),
        _ => panic!("expected Pause"),
    }
}

#[test]
fn cli_parse_resume() {
    match parse(&["ketch", "resume", "a1b2c3"]) {
        CliCommand::Resume { id } => assert_eq!(id, "a1b2c3"),
        _ => panic!("expected Resume"),
    }
}

#[test]
fn cli_parse_remove() {
    match parse(&["ketch", "remove", "a1b2c3"]) {
        CliCommand::Remove { id } => assert_eq!(id, "a1b2c3"),
        _ => panic!("expected Remove"),
    }
}

#[test]
fn cli_parse_rejects_unknown_subcommand() {
    assert!(Cli::try_parse_from(["ketch", "bogus"]).is_err());
}
