/// Batch of worker processes driven through their pipes
///
/// Spawns five children that each sleep a little, read one line from stdin
/// and report it back on stdout. The third child is canceled before it gets
/// its input; the others are sent the current time, waited for, and their
/// output is printed next to their exit status.
///
/// Set `RUST_LOG=pipefork=debug` to follow the lifecycle of each child.
use anyhow::{Context, Result};
use pipefork::Process;
use std::io::{self, BufRead, Read, Write};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const NUM_PROCESSES: usize = 5;
const CANCELED_INDEX: usize = 2;

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Work done inside each child
fn do_something() {
    let pid = std::process::id();
    sleep(Duration::from_secs(2 + u64::from(pid % 3)));

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        pipefork::exit(1);
    }
    let _ = write!(
        io::stdout(),
        "do_something:{}:{}:{}",
        pid,
        line.trim_end(),
        unix_time()
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut processes = Vec::with_capacity(NUM_PROCESSES);
    for _ in 0..NUM_PROCESSES {
        let process = Process::spawn(do_something).context("Unable to fork")?;
        println!("Spawned: {}", process.id());
        processes.push(process);
    }

    let canceled = &mut processes[CANCELED_INDEX];
    println!("Canceling: {}", canceled.id());
    canceled.cancel();
    println!("Canceled: {}", canceled.id());

    for process in processes.iter().filter(|p| p.is_alive()) {
        let line = format!("{}\n", unix_time());
        process.input().write_all(line.as_bytes()).with_context(|| {
            format!(
                "Unexpected error while writing to input stream of process: {}",
                process.id()
            )
        })?;
    }

    for mut process in processes {
        let info = if process.is_alive() {
            process.wait()?
        } else {
            process.exit_info()?
        };

        let mut output = Vec::new();
        process.output().read_to_end(&mut output).with_context(|| {
            format!(
                "Unexpected error while reading from output stream of process: {}",
                process.id()
            )
        })?;

        println!(
            "Process: {} normallyExited: {} exitValue: {:2} output: {}",
            process.id(),
            info.exited_normally,
            info.exit_code,
            String::from_utf8_lossy(&output)
        );
        process.teardown();
    }

    Ok(())
}
