//! Host-side supervisor client.
//!
//! Connects to the container's `wshd.sock`, submits a spawn request
//! built from its flags and `RLIMIT_*` environment, receives the
//! process's descriptors over SCM_RIGHTS, proxies stdio, forwards
//! signal numbers read from fd 3 (`--readSignals`), and exits with the
//! process's exit status.

use burrow_supervisor::protocol::{
    read_frame, recv_fds, write_frame, Request, Response, SpawnRequest,
};
use clap::Parser;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::exit;
use std::sync::{Arc, Mutex};

#[derive(Debug, Parser)]
#[command(name = "wsh", about = "burrow supervisor client")]
struct Cli {
    /// Path to the supervisor socket.
    #[arg(long)]
    socket: PathBuf,

    /// User to run the process as.
    #[arg(long)]
    user: String,

    /// Environment entries (repeatable).
    #[arg(long = "env")]
    env: Vec<String>,

    /// Working directory inside the container.
    #[arg(long)]
    dir: Option<String>,

    /// Write the spawned process's container pid to this file.
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Forward decimal signal numbers read from fd 3 to the process.
    #[arg(long = "readSignals", default_value_t = false)]
    read_signals: bool,

    /// Allocate a pseudoterminal for the process.
    #[arg(long, default_value_t = false)]
    tty: bool,

    #[arg(long = "windowColumns")]
    window_columns: Option<u16>,

    #[arg(long = "windowRows")]
    window_rows: Option<u16>,

    /// Command and arguments to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    argv: Vec<String>,
}

fn rlimits_from_env() -> BTreeMap<String, u64> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with("RLIMIT_"))
        .filter_map(|(key, value)| value.parse().ok().map(|v| (key, v)))
        .collect()
}

fn die(message: String) -> ! {
    eprintln!("wsh: {message}");
    exit(255)
}

fn main() {
    let cli = Cli::parse();

    let tty = cli.tty.then(|| burrow_schema::types::TtySpec {
        window_size: cli.window_columns.zip(cli.window_rows).map(|(columns, rows)| {
            burrow_schema::types::WindowSize { columns, rows }
        }),
    });

    let request = Request::Spawn(SpawnRequest {
        user: cli.user,
        dir: cli.dir,
        env: cli.env,
        argv: cli.argv,
        tty,
        rlimits: rlimits_from_env(),
        drop_capabilities: true,
    });

    let mut stream = UnixStream::connect(&cli.socket)
        .unwrap_or_else(|e| die(format!("connect {}: {e}", cli.socket.display())));
    write_frame(&mut stream, &request).unwrap_or_else(|e| die(format!("send request: {e}")));

    let pid = match read_frame::<Response>(&mut stream) {
        Ok(Response::Fds { count, pid }) => {
            if count != 4 {
                die(format!("unexpected descriptor count: {count}"));
            }
            pid
        }
        Ok(Response::Error { message }) => die(message),
        Ok(other) => die(format!("unexpected response: {other:?}")),
        Err(e) => die(format!("read response: {e}")),
    };

    let mut fds = recv_fds(&stream, 4).unwrap_or_else(|e| die(format!("receive fds: {e}")));
    let status_fd = File::from(fds.pop().unwrap());
    let stderr_fd = File::from(fds.pop().unwrap());
    let stdout_fd = File::from(fds.pop().unwrap());
    let stdin_fd = File::from(fds.pop().unwrap());

    if let Some(pidfile) = &cli.pidfile {
        if let Some(parent) = pidfile.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(pidfile, format!("{pid}\n"))
            .unwrap_or_else(|e| die(format!("write pidfile: {e}")));
    }

    // Stdio proxies. The stdin copy closes the write end on EOF so the
    // process sees EOF too; the out/err copies run until the process
    // side closes.
    std::thread::spawn(move || {
        let mut stdin_fd = stdin_fd;
        let _ = std::io::copy(&mut std::io::stdin().lock(), &mut stdin_fd);
    });
    let stdout_thread = std::thread::spawn(move || {
        let mut stdout_fd = stdout_fd;
        let _ = std::io::copy(&mut stdout_fd, &mut std::io::stdout().lock());
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut stderr_fd = stderr_fd;
        let _ = std::io::copy(&mut stderr_fd, &mut std::io::stderr().lock());
    });

    // EOF on the status stream means the exec succeeded; any content is
    // a structured pre-exec failure.
    std::thread::spawn(move || {
        let mut status_fd = status_fd;
        let mut contents = String::new();
        if status_fd.read_to_string(&mut contents).is_ok() && !contents.is_empty() {
            eprintln!("wsh: {contents}");
            exit(255);
        }
    });

    if cli.read_signals {
        let writer = Arc::new(Mutex::new(
            stream.try_clone().unwrap_or_else(|e| die(format!("clone stream: {e}"))),
        ));
        std::thread::spawn(move || {
            // SAFETY: fd 3 is the signal pipe the daemon installed
            // before exec; it is owned by this thread alone.
            let signals = unsafe { File::from_raw_fd(3) };
            for line in BufReader::new(signals).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if let Ok(signal) = line.trim().parse::<i32>() {
                    let mut writer = writer.lock().unwrap();
                    let _ = write_frame(&mut *writer, &Request::Signal { pid, signal });
                }
            }
        });
    }

    loop {
        match read_frame::<Response>(&mut stream) {
            Ok(Response::Exit { status }) => {
                let _ = stdout_thread.join();
                let _ = stderr_thread.join();
                let _ = std::io::stdout().flush();
                let _ = std::io::stderr().flush();
                exit(status as i32);
            }
            Ok(_) => continue,
            Err(e) => die(format!("connection to supervisor lost: {e}")),
        }
    }
}
