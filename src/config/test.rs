use std::io::{Read, Seek, Write};

use super::*;

fn parse(args: &[&str]) -> Result<Startup, ConfigError> {
    Config::from_args(std::iter::once(NAME).chain(args.iter().copied()))
}

fn run(args: &[&str]) -> Config {
    match parse(args) {
        Ok(Startup::Run(config)) => config,
        other => panic!("expected a runnable config, got {other:?}"),
    }
}

fn usage_error(args: &[&str]) {
    match parse(args) {
        Err(ConfigError::Usage(_)) => (),
        other => panic!("expected a usage error, got {other:?}"),
    }
}

#[test]
fn test_defaults() {
    let config = run(&[]);
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.hostname, DEFAULT_HOSTNAME);
    assert_eq!(config.storage_root, std::env::current_dir().unwrap());
    assert!(!config.chroot);
    assert!(!config.detach);
    assert!(matches!(config.log, LogTarget::Stdout));
    assert_eq!(config.uid, None);
    assert_eq!(config.gid, None);
}

#[test]
fn test_short_flags() {
    let config = run(&[
        "-p", "8080", "-n", "example.org", "-r", "/srv/www", "-d", "-u",
        "1000", "-g", "100",
    ]);
    assert_eq!(config.port, 8080);
    assert_eq!(config.hostname, "example.org");
    assert_eq!(config.storage_root, PathBuf::from("/srv/www"));
    assert!(config.detach);
    assert!(!config.chroot);
    assert_eq!(config.uid, Some(1000));
    assert_eq!(config.gid, Some(100));
}

#[test]
fn test_long_flags() {
    let config = run(&[
        "--port=8081",
        "--hostname",
        "example.net",
        "--root=/srv/data",
        "--chroot",
        "--detach",
        "--uid=33",
        "--gid",
        "34",
    ]);
    assert_eq!(config.port, 8081);
    assert_eq!(config.hostname, "example.net");
    assert_eq!(config.storage_root, PathBuf::from("/srv/data"));
    assert!(config.chroot);
    assert!(config.detach);
    assert_eq!(config.uid, Some(33));
    assert_eq!(config.gid, Some(34));
}

#[test]
fn test_real_storage_root() {
    let config = run(&["-r", "/srv/www"]);
    assert_eq!(config.real_storage_root(), Path::new("/srv/www"));

    let config = run(&["-r", "/srv/www", "--chroot"]);
    assert_eq!(config.storage_root, PathBuf::from("/srv/www"));
    assert_eq!(config.real_storage_root(), Path::new("/"));
}

#[test]
fn test_unknown_flag() {
    usage_error(&["--bogus"]);
    usage_error(&["-x"]);
}

#[test]
fn test_bad_values() {
    usage_error(&["-p", "http"]);
    usage_error(&["-p", "70000"]);
    usage_error(&["-u", "nobody"]);
    usage_error(&["--gid=-1"]);
    usage_error(&["--port"]);
}

#[test]
fn test_uid_conflicts_with_user() {
    usage_error(&["-u", "0", "--user", "root"]);
    usage_error(&["-g", "0", "--group", "root"]);
}

#[test]
fn test_help() {
    for flag in ["-h", "--help"] {
        match parse(&[flag]) {
            Ok(Startup::Help(text)) => {
                assert!(text.contains("--log-file"));
                assert!(text.contains("--chroot"));
            }
            other => panic!("expected help, got {other:?}"),
        }
    }
}

#[test]
fn test_help_skips_lookups() {
    let r = parse(&["-h", "--user", "no-such-user-for-rs-serve"]);
    assert!(matches!(r, Ok(Startup::Help(_))));
}

#[test]
fn test_help_before_bad_argument() {
    assert!(matches!(parse(&["-h", "--bogus"]), Ok(Startup::Help(_))));
    assert!(matches!(
        parse(&["-v", "-p", "http"]),
        Ok(Startup::Version(_))
    ));
    usage_error(&["--bogus", "-h"]);
}

#[test]
fn test_version() {
    for flag in ["-v", "--version"] {
        match parse(&[flag]) {
            Ok(Startup::Version(text)) => {
                assert_eq!(text, format!("rs-serve {VERSION}\n"));
            }
            other => panic!("expected version, got {other:?}"),
        }
    }
}

#[test]
fn test_user_matches_uid() {
    let uid = uzers::get_current_uid();
    let name = uzers::get_current_username().expect("no current user");
    let name = name.to_str().expect("user name not utf-8");

    let by_name = run(&["--user", name]);
    let by_id = run(&["-u", &uid.to_string()]);
    assert_eq!(by_name.uid, Some(uid));
    assert_eq!(by_name.uid, by_id.uid);
}

#[test]
fn test_group_matches_gid() {
    let gid = uzers::get_current_gid();
    let name = uzers::get_current_groupname().expect("no current group");
    let name = name.to_str().expect("group name not utf-8");

    let by_name = run(&["--group", name]);
    let by_id = run(&["-g", &gid.to_string()]);
    assert_eq!(by_name.gid, Some(gid));
    assert_eq!(by_name.gid, by_id.gid);
}

#[test]
fn test_unknown_user() {
    match parse(&["--user", "no-such-user-for-rs-serve"]) {
        Err(ConfigError::UnknownUser(name)) => {
            assert_eq!(name, "no-such-user-for-rs-serve")
        }
        other => panic!("expected unknown user, got {other:?}"),
    }
}

#[test]
fn test_unknown_group() {
    match parse(&["--group", "no-such-group-for-rs-serve"]) {
        Err(e @ ConfigError::UnknownGroup(_)) => assert_eq!(
            e.to_string(),
            "Failed to find GID for group \"no-such-group-for-rs-serve\"."
        ),
        other => panic!("expected unknown group, got {other:?}"),
    }
}

#[test]
fn test_log_file_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("serve.log");
    std::fs::write(&path, "first\n").unwrap();

    let config = run(&["-f", path.to_str().unwrap()]);
    let LogTarget::File { path: ref p, ref file } = config.log else {
        panic!("expected a log file");
    };
    assert_eq!(p, &path);

    let mut file = file.try_clone().unwrap();
    file.write_all(b"second\n").unwrap();
    drop(config);

    let mut contents = String::new();
    let mut f = File::open(&path).unwrap();
    f.rewind().unwrap();
    f.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "first\nsecond\n");
}

#[test]
fn test_log_file_created() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("new.log");
    let config = run(&["--log-file", path.to_str().unwrap()]);
    assert!(matches!(config.log, LogTarget::File { .. }));
    assert!(path.is_file());
}

#[test]
fn test_log_file_unopenable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("serve.log");
    match parse(&["-f", path.to_str().unwrap()]) {
        Err(ConfigError::LogFile { path: p, source }) => {
            assert_eq!(p, path);
            assert_eq!(source.kind(), io::ErrorKind::NotFound);
        }
        other => panic!("expected log file error, got {other:?}"),
    }
}

#[test]
fn test_install() {
    let config = run(&["-p", "8082"]);
    let installed = install(config).unwrap();
    assert_eq!(installed.port, 8082);
    assert!(matches!(
        install(run(&[])),
        Err(ConfigError::AlreadyInstalled)
    ));
}
