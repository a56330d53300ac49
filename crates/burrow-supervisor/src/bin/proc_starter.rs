//! Spawn helper: applies working directory, rlimits, capabilities, and
//! credentials, then execs the target command.
//!
//! Invoked by `wshd` as
//! `proc_starter -uid=0 -gid=0 [-workDir=D] [-rlimits=K=V,…]
//! [-dropCapabilities=false] -- <command> [args…]`.

use burrow_supervisor::proc_starter::{start, StarterSpec};
use std::process::exit;

fn die(message: &str) -> ! {
    eprintln!("proc_starter: {message}");
    exit(1)
}

fn parse_spec() -> StarterSpec {
    let mut spec = StarterSpec {
        uid: 0,
        gid: 0,
        work_dir: None,
        rlimits: String::new(),
        drop_capabilities: true,
        argv: Vec::new(),
        keep_fds: vec![3],
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--" {
            spec.argv = args.collect();
            break;
        }

        let flag = arg.trim_start_matches('-');
        let (key, value) = match flag.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.to_owned()),
            None => {
                let value = args
                    .next()
                    .unwrap_or_else(|| die(&format!("flag {arg} requires a value")));
                (flag.to_owned(), value)
            }
        };

        match key.as_str() {
            "uid" => {
                spec.uid = value
                    .parse()
                    .unwrap_or_else(|_| die(&format!("invalid uid: {value}")));
            }
            "gid" => {
                spec.gid = value
                    .parse()
                    .unwrap_or_else(|_| die(&format!("invalid gid: {value}")));
            }
            "workDir" => spec.work_dir = Some(value),
            "rlimits" => spec.rlimits = value,
            "dropCapabilities" => spec.drop_capabilities = value != "false",
            other => die(&format!("unknown flag: {other}")),
        }
    }

    if spec.argv.is_empty() {
        die("no command specified after --");
    }
    spec
}

fn main() {
    let spec = parse_spec();
    // start only returns when exec failed.
    let err = start(&spec);
    report_failure(&err);
    exit(255);
}

/// Failures before exec go to the status descriptor (fd 3) when the
/// supervisor gave us one; EOF there without content means the exec
/// succeeded. Stderr gets a copy either way.
fn report_failure(err: &burrow_supervisor::SupervisorError) {
    use std::io::Write;
    use std::mem::ManuallyDrop;
    use std::os::fd::FromRawFd;

    if nix::fcntl::fcntl(3, nix::fcntl::FcntlArg::F_GETFD).is_ok() {
        // SAFETY: fd 3 is the status pipe; ManuallyDrop leaves it open
        // for the process exit to close.
        let file = unsafe { std::fs::File::from_raw_fd(3) };
        let mut status = ManuallyDrop::new(file);
        let _ = write!(
            status,
            "{}",
            serde_json::json!({ "type": "error", "message": err.to_string() })
        );
        let _ = status.flush();
    }
    eprintln!("proc_starter: {err}");
}
