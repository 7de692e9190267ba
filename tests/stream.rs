mod common;

use anyhow::Result;
use common::{drain, listener, pump_for, pump_until};
use horizon_mnet::{
    AcceptBalancer, ActiveEvent, ChannelId, ChannelState, ChannelType, Engine, EngineBuilder,
    Error, Event,
};
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(5);

#[test]
fn ping_pong() -> Result<()> {
    let mut engine = Engine::new()?;
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let client = engine.open(ChannelType::Stream)?;
    engine.connect(client, "127.0.0.1", port)?;
    assert_eq!(engine.state(client)?, ChannelState::Connecting);

    let mut peer = None;
    let mut reply = Vec::new();
    pump_until(&mut engine, LIMIT, |engine, msg| {
        let mut buf = [0u8; 64];
        match msg.event {
            Event::Accept if msg.channel == server => peer = msg.accepted,
            Event::Connected if msg.channel == client => {
                assert_eq!(engine.send(client, b"ping")?, 4);
            }
            Event::Recv if Some(msg.channel) == peer => {
                let n = engine.recv(msg.channel, &mut buf)?;
                if n > 0 {
                    assert_eq!(&buf[..n], b"ping");
                    engine.send(msg.channel, b"pong")?;
                }
            }
            Event::Recv if msg.channel == client => {
                let n = engine.recv(client, &mut buf)?;
                reply.extend_from_slice(&buf[..n]);
                return Ok(reply.len() >= 4);
            }
            _ => {}
        }
        Ok(false)
    })?;

    assert_eq!(reply, b"pong");
    let peer = peer.expect("accepted peer");
    assert_eq!(engine.state(peer)?, ChannelState::Connected);
    assert_eq!(engine.bytes(client, true)?, 4);
    assert_eq!(engine.bytes(client, false)?, 4);
    assert_eq!(engine.peer_addr(peer)?.ip, "127.0.0.1");
    assert_eq!(engine.peer_addr(client)?.port, port);
    Ok(())
}

#[test]
fn large_payload_arrives_in_order() -> Result<()> {
    const TOTAL: usize = 4 << 20;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();

    let mut engine = EngineBuilder::new().chunk_size(8 * 1024).build()?;
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let client = engine.open(ChannelType::Stream)?;
    engine.set_bufsize(client, 16 * 1024)?;
    engine.connect(client, "127.0.0.1", port)?;

    let mut received = Vec::with_capacity(TOTAL);
    let mut queued_at_send = 0;
    pump_until(&mut engine, Duration::from_secs(20), |engine, msg| {
        match msg.event {
            Event::Connected if msg.channel == client => {
                assert_eq!(engine.send(client, &payload)?, TOTAL);
                queued_at_send = engine.cached(client)?;
            }
            Event::Recv if msg.channel != server && msg.channel != client => {
                drain(engine, msg.channel, &mut received)?;
            }
            _ => {}
        }
        Ok(received.len() >= TOTAL)
    })?;

    assert!(queued_at_send > 0, "payload should exceed the socket buffer");
    assert_eq!(received.len(), TOTAL);
    assert!(received == payload, "bytes reordered or corrupted");
    assert_eq!(engine.cached(client)?, 0);
    assert_eq!(engine.bytes(client, true)?, TOTAL as u64);
    Ok(())
}

#[test]
fn disconnect_drops_queued_chunks() -> Result<()> {
    let mut engine = EngineBuilder::new().chunk_size(1024).build()?;
    let server = engine.open(ChannelType::Stream)?;
    engine.set_bufsize(server, 4096)?;
    engine.listen(server, "127.0.0.1", 0, 0)?;
    let port = engine.local_addr(server)?.port;

    let client = engine.open(ChannelType::Stream)?;
    engine.set_bufsize(client, 4096)?;
    engine.connect(client, "127.0.0.1", port)?;
    pump_until(&mut engine, LIMIT, |_, msg| Ok(msg.event == Event::Connected))?;

    engine.active_event(client, ActiveEvent::Send(true))?;
    engine.send(client, &vec![0x5a; 1 << 20])?;
    assert!(engine.cached_chunks(client)? >= 3);
    assert!(engine.cached(client)? > 0);

    engine.disconnect(client)?;
    assert_eq!(engine.cached_chunks(client)?, 0);
    assert_eq!(engine.cached(client)?, 0);
    assert_eq!(engine.state(client)?, ChannelState::Disconnected);

    pump_for(&mut engine, Duration::from_millis(200), |_, msg| {
        assert_ne!(msg.channel, client, "no event after a requested disconnect");
        Ok(())
    })?;
    Ok(())
}

#[test]
fn close_inside_recv_is_deferred() -> Result<()> {
    let mut engine = Engine::new()?;
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let clients = [engine.open(ChannelType::Stream)?, engine.open(ChannelType::Stream)?];
    for c in clients {
        engine.connect(c, "127.0.0.1", port)?;
    }

    let mut closed: Vec<ChannelId> = Vec::new();
    pump_until(&mut engine, LIMIT, |engine, msg| {
        match msg.event {
            Event::Connected => {
                engine.send(msg.channel, b"bye")?;
            }
            Event::Recv if msg.channel != server && !clients.contains(&msg.channel) => {
                engine.close(msg.channel)?;
                // still addressable until the next poll
                assert_eq!(engine.state(msg.channel)?, ChannelState::Closed);
                assert_eq!(engine.opaque(msg.channel)?, None);
                assert!(engine.recv(msg.channel, &mut [0u8; 8]).is_err());
                closed.push(msg.channel);
            }
            _ => {}
        }
        Ok(closed.len() == 2)
    })?;

    let summary = engine.poll(Some(Duration::ZERO))?;
    assert_eq!(summary.channels, 3);
    for id in &closed {
        assert!(matches!(engine.state(*id), Err(Error::InvalidHandle)));
    }
    while engine.next_message().is_some() {}
    assert_eq!(engine.channel_count(), 3);
    Ok(())
}

#[test]
fn refused_connect_reports_disconnect_then_reconnects() -> Result<()> {
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0")?;
        spare.local_addr()?.port()
    };

    let mut engine = Engine::new()?;
    let client = engine.open(ChannelType::Stream)?;
    engine.set_opaque(client, Some(7))?;
    engine.connect(client, "127.0.0.1", port)?;

    let mut err = None;
    pump_until(&mut engine, LIMIT, |_, msg| {
        if msg.event == Event::Disconnect && msg.channel == client {
            assert_eq!(msg.opaque, Some(7));
            err = Some(msg.err);
            return Ok(true);
        }
        Ok(false)
    })?;
    assert_eq!(err, Some(libc::ECONNREFUSED));
    assert_eq!(engine.state(client)?, ChannelState::Disconnected);

    let (_server, live) = listener(&mut engine, ChannelType::Stream)?;
    engine.connect(client, "127.0.0.1", live)?;
    pump_until(&mut engine, LIMIT, |_, msg| {
        Ok(msg.event == Event::Connected && msg.channel == client)
    })?;
    assert_eq!(engine.state(client)?, ChannelState::Connected);
    Ok(())
}

#[test]
fn peer_close_surfaces_as_disconnect() -> Result<()> {
    let mut engine = Engine::new()?;
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let client = engine.open(ChannelType::Stream)?;
    engine.connect(client, "127.0.0.1", port)?;

    let mut connected = false;
    let mut accepted = false;
    pump_until(&mut engine, LIMIT, |engine, msg| {
        match msg.event {
            Event::Accept if msg.channel == server => {
                if let Some(peer) = msg.accepted {
                    engine.close(peer)?;
                    accepted = true;
                }
            }
            Event::Connected if msg.channel == client => connected = true,
            _ => {}
        }
        Ok(accepted && connected)
    })?;

    let mut seen = None;
    pump_until(&mut engine, LIMIT, |engine, msg| {
        if msg.channel != client {
            return Ok(false);
        }
        match msg.event {
            Event::Recv => {
                let mut sink = Vec::new();
                if let Err(e) = drain(engine, client, &mut sink) {
                    assert!(e.downcast_ref::<Error>().is_some());
                }
                Ok(false)
            }
            Event::Disconnect => {
                seen = Some(msg.err);
                Ok(true)
            }
            _ => Ok(false),
        }
    })?;
    assert!(seen.is_some());
    assert_eq!(engine.state(client)?, ChannelState::Disconnected);
    Ok(())
}

struct CountingBalancer {
    before: Rc<Cell<u32>>,
    after: Rc<Cell<u32>>,
    allow: bool,
}

impl AcceptBalancer for CountingBalancer {
    fn before(&mut self, _listen_fd: RawFd) -> bool {
        self.before.set(self.before.get() + 1);
        self.allow
    }

    fn after(&mut self, _listen_fd: RawFd) {
        self.after.set(self.after.get() + 1);
    }
}

#[test]
fn accept_goes_through_balancer() -> Result<()> {
    let before = Rc::new(Cell::new(0));
    let after = Rc::new(Cell::new(0));
    let mut engine = Engine::new()?;
    engine.set_accept_balancer(Some(Box::new(CountingBalancer {
        before: before.clone(),
        after: after.clone(),
        allow: true,
    })));
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let client = engine.open(ChannelType::Stream)?;
    engine.connect(client, "127.0.0.1", port)?;

    pump_until(&mut engine, LIMIT, |_, msg| {
        Ok(msg.event == Event::Accept && msg.channel == server)
    })?;
    assert!(before.get() >= 1);
    assert_eq!(before.get(), after.get());
    Ok(())
}

#[test]
fn declining_balancer_skips_accept() -> Result<()> {
    let before = Rc::new(Cell::new(0));
    let after = Rc::new(Cell::new(0));
    let mut engine = Engine::new()?;
    engine.set_accept_balancer(Some(Box::new(CountingBalancer {
        before: before.clone(),
        after: after.clone(),
        allow: false,
    })));
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let client = engine.open(ChannelType::Stream)?;
    engine.connect(client, "127.0.0.1", port)?;

    pump_for(&mut engine, Duration::from_millis(300), |_, msg| {
        assert!(!(msg.event == Event::Accept && msg.channel == server));
        Ok(())
    })?;
    assert!(before.get() >= 1);
    assert_eq!(after.get(), 0);

    engine.set_accept_balancer(None);
    pump_until(&mut engine, LIMIT, |_, msg| Ok(msg.event == Event::Accept))?;
    Ok(())
}

#[test]
fn dispatch_delivers_to_handler() -> Result<()> {
    let mut engine = Engine::new()?;
    let (_server, port) = listener(&mut engine, ChannelType::Stream)?;
    let client = engine.open(ChannelType::Stream)?;
    engine.connect(client, "127.0.0.1", port)?;

    let mut events = Vec::new();
    for _ in 0..50 {
        engine.dispatch(Some(Duration::from_millis(10)), |_, msg| events.push(msg.event))?;
        if events.contains(&Event::Accept) && events.contains(&Event::Connected) {
            return Ok(());
        }
    }
    anyhow::bail!("accept/connect not dispatched: {:?}", events)
}

#[test]
fn reconnect_inside_batch_ignores_old_readiness() -> Result<()> {
    let mut engine = Engine::new()?;
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let client = engine.open(ChannelType::Stream)?;
    engine.connect(client, "127.0.0.1", port)?;

    let mut peer = None;
    let mut connected = false;
    pump_until(&mut engine, LIMIT, |_, msg| {
        match msg.event {
            Event::Accept if msg.channel == server => peer = msg.accepted,
            Event::Connected if msg.channel == client => connected = true,
            _ => {}
        }
        Ok(peer.is_some() && connected)
    })?;
    let peer = peer.expect("accepted peer");

    // one batch then carries both read and write readiness for the client
    engine.active_event(client, ActiveEvent::Send(true))?;
    engine.send(peer, b"x")?;
    std::thread::sleep(Duration::from_millis(50));

    let mut reconnected = false;
    for _ in 0..50 {
        engine.poll(Some(Duration::from_millis(10)))?;
        while let Some(msg) = engine.next_message() {
            if msg.channel != client {
                continue;
            }
            match msg.event {
                Event::Recv if !reconnected => {
                    engine.disconnect(client)?;
                    // unroutable, so the handshake stays in flight
                    if engine.connect(client, "10.255.255.1", 9).is_err() {
                        return Ok(());
                    }
                    reconnected = true;
                }
                Event::Connected => anyhow::bail!("connected on readiness of the old socket"),
                _ => {}
            }
        }
        if reconnected {
            break;
        }
    }
    assert!(reconnected);

    pump_for(&mut engine, Duration::from_millis(200), |_, msg| {
        anyhow::ensure!(
            !(msg.channel == client && msg.event == Event::Connected),
            "handshake to an unroutable host reported as complete"
        );
        Ok(())
    })?;
    assert_ne!(engine.state(client)?, ChannelState::Connected);
    Ok(())
}

#[test]
fn event_queue_reset_keeps_channels_live() -> Result<()> {
    let mut engine = Engine::new()?;
    let (server, port) = listener(&mut engine, ChannelType::Stream)?;
    let first = engine.open(ChannelType::Stream)?;
    engine.connect(first, "127.0.0.1", port)?;

    let mut peer = None;
    let mut connected = false;
    pump_until(&mut engine, LIMIT, |_, msg| {
        match msg.event {
            Event::Accept if msg.channel == server => peer = msg.accepted,
            Event::Connected if msg.channel == first => connected = true,
            _ => {}
        }
        Ok(peer.is_some() && connected)
    })?;
    let peer = peer.expect("accepted peer");

    engine.reset_event_queue()?;
    assert_eq!(engine.state(first)?, ChannelState::Connected);
    assert!(engine.fd(server)?.is_some());

    engine.send(first, b"after reset")?;
    let second = engine.open(ChannelType::Stream)?;
    engine.connect(second, "127.0.0.1", port)?;

    let mut got = Vec::new();
    let mut accepted = false;
    let mut second_up = false;
    pump_until(&mut engine, LIMIT, |engine, msg| {
        match msg.event {
            Event::Recv if msg.channel == peer => drain(engine, peer, &mut got)?,
            Event::Accept if msg.channel == server => accepted = true,
            Event::Connected if msg.channel == second => second_up = true,
            _ => {}
        }
        Ok(got.len() >= 11 && accepted && second_up)
    })?;
    assert_eq!(got, b"after reset");
    Ok(())
}
