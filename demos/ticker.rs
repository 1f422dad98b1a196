use std::env;
use std::fs::OpenOptions;
use std::thread;
use std::time::Duration;

use daemon_context::DaemonContext;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let pwd = env::current_dir()?;
    let log_path = pwd.join("ticker.log");
    let err_path = pwd.join("ticker.err");
    let pid_path = pwd.join("ticker.pid");

    let stdout_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let stderr_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&err_path)?;

    println!("Launching a simple ticker daemon...");
    println!("Logs will be written to: {}", log_path.display());
    println!("Stop it with: kill $(cat {})", pid_path.display());

    let mut context = DaemonContext::new()
        .process_name("ticker")
        .pid_file(&pid_path)
        .working_directory(&pwd)
        .umask(0o027)
        .stdout(stdout_file)
        .stderr(stderr_file)
        .build()?;

    // Only the daemon gets past this point.
    let daemon = context.enter()?;
    println!("[Ticker] Service started. PID: {}", std::process::id());

    let phrases = ["still here", "tick", "tock", "hello world"];
    let mut i = 0;
    while !daemon.shutdown_requested() {
        println!("[Ticker] Ping #{} - {}", i, phrases[i % phrases.len()]);
        i += 1;
        // Short sleeps keep shutdown responsive.
        for _ in 0..30 {
            if daemon.shutdown_requested() {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    println!("[Ticker] Stop signal received. Shutting down cleanly.");
    daemon.close()?;
    Ok(())
}
