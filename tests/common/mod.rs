#![allow(dead_code)]

use anyhow::{bail, Result};
use horizon_mnet::{ChannelId, ChannelType, Engine, Message};
use std::time::{Duration, Instant};

/// Runs poll cycles until `f` returns `true` for a message
pub fn pump_until<F>(engine: &mut Engine, limit: Duration, mut f: F) -> Result<()>
where
    F: FnMut(&mut Engine, Message) -> Result<bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        engine.poll(Some(Duration::from_millis(10)))?;
        while let Some(msg) = engine.next_message() {
            if f(engine, msg)? {
                return Ok(());
            }
        }
    }
    bail!("condition not reached within {:?}", limit)
}

/// Runs poll cycles for `span`, handing every message to `f`
pub fn pump_for<F>(engine: &mut Engine, span: Duration, mut f: F) -> Result<()>
where
    F: FnMut(&mut Engine, Message) -> Result<()>,
{
    let deadline = Instant::now() + span;
    while Instant::now() < deadline {
        engine.poll(Some(Duration::from_millis(10)))?;
        while let Some(msg) = engine.next_message() {
            f(engine, msg)?;
        }
    }
    Ok(())
}

/// Opens a listening channel of `ctype` on an ephemeral loopback port
pub fn listener(engine: &mut Engine, ctype: ChannelType) -> Result<(ChannelId, u16)> {
    let server = engine.open(ctype)?;
    engine.listen(server, "127.0.0.1", 0, 0)?;
    let port = engine.local_addr(server)?.port;
    Ok((server, port))
}

/// Reads everything currently available
pub fn drain(engine: &mut Engine, chann: ChannelId, out: &mut Vec<u8>) -> Result<()> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = engine.recv(chann, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        out.extend_from_slice(&buf[..n]);
    }
}
