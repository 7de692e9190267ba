//! Runs alone in its own process: it lowers the descriptor limit.

mod common;

use anyhow::{ensure, Result};
use common::{listener, pump_for};
use horizon_mnet::{ChannelType, Engine, Event};
use std::net::TcpStream;
use std::time::Duration;

fn nofile_limit() -> Result<libc::rlimit> {
    let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    ensure!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } == 0, "getrlimit failed");
    Ok(lim)
}

fn set_nofile_limit(lim: &libc::rlimit) -> Result<()> {
    ensure!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, lim) } == 0, "setrlimit failed");
    Ok(())
}

/// Lowest descriptor number the next `accept` would get
fn lowest_free_fd() -> Result<libc::rlim_t> {
    let fd = unsafe { libc::dup(0) };
    ensure!(fd >= 0, "dup failed");
    unsafe { libc::close(fd) };
    Ok(fd as libc::rlim_t)
}

#[test]
fn accept_resumes_after_descriptor_exhaustion() -> Result<()> {
    let mut engine = Engine::new()?;
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;

    // completed handshakes wait in the kernel queue
    let _a = TcpStream::connect(("127.0.0.1", port))?;
    let _b = TcpStream::connect(("127.0.0.1", port))?;

    let saved = nofile_limit()?;
    let tight = libc::rlimit { rlim_cur: lowest_free_fd()?, rlim_max: saved.rlim_max };
    set_nofile_limit(&tight)?;

    let mut starved = 0;
    let res = pump_for(&mut engine, Duration::from_millis(100), |_, msg| {
        if msg.event == Event::Accept && msg.channel == server {
            starved += 1;
        }
        Ok(())
    });
    set_nofile_limit(&saved)?;
    res?;
    assert_eq!(starved, 0);

    let mut accepted = 0;
    pump_for(&mut engine, Duration::from_millis(500), |_, msg| {
        if msg.event == Event::Accept && msg.channel == server {
            accepted += 1;
        }
        Ok(())
    })?;
    assert_eq!(accepted, 2);
    Ok(())
}
