use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use tempfile::NamedTempFile;
use tidenet_core::transport::IpcNetworkInterface;
use tidenet_core::{
    ConnectionState, DataStreamWriter, IpcHub, ManualClock, NetworkConfig, NetworkConnection,
    NetworkDriver, NetworkEndPoint, NetworkEventType, ReadContext,
};

fn ipc_driver(hub: &IpcHub, clock: &ManualClock, config: NetworkConfig) -> Result<NetworkDriver> {
    let mut driver = NetworkDriver::with_clock(
        IpcNetworkInterface::new(hub.clone()),
        config,
        Arc::new(clock.clone()),
    )?;
    driver.bind(&hub.create_endpoint())?;
    Ok(driver)
}

#[test]
fn test_ipc_many_clients_concurrent_drain() -> Result<()> {
    let hub = IpcHub::new();
    let clock = ManualClock::new(0);
    let mut server = ipc_driver(&hub, &clock, NetworkConfig::default())?;
    server.listen()?;
    let server_addr = server.local_endpoint().expect("server bound");

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut client = ipc_driver(&hub, &clock, NetworkConfig::default())?;
        let conn = client.connect(&server_addr)?;
        client.update()?;
        clients.push((client, conn));
    }
    server.update()?;
    for (client, conn) in clients.iter_mut() {
        client.update()?;
        assert_eq!(client.connection_state(*conn), ConnectionState::Connected);
    }

    let accepted: Vec<NetworkConnection> = std::iter::from_fn(|| server.accept()).collect();
    assert_eq!(accepted.len(), 4);

    // Each client sends more messages than the initial per-connection capacity.
    for (index, (client, conn)) in clients.iter_mut().enumerate() {
        for seq in 0..12u32 {
            let mut writer = DataStreamWriter::new(16);
            writer.write(index as u32)?;
            writer.write_network_byte_order(seq)?;
            client.send(*conn, writer.as_slice())?;
        }
        client.update()?;
    }
    server.update()?;

    let view = server.concurrent();
    let results: Vec<(NetworkEndPoint, Vec<(u32, u32)>)> = thread::scope(|scope| {
        let workers: Vec<_> = accepted
            .iter()
            .map(|&handle| {
                scope.spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(event) = view.pop_event_for_connection(handle) {
                        assert_eq!(event.kind, NetworkEventType::Data);
                        let payload = view.payload(&event);
                        let reader = tidenet_core::DataStreamReader::new(payload);
                        let mut ctx = ReadContext::default();
                        let index = reader.read::<u32>(&mut ctx).expect("index");
                        let seq = reader.read_network_byte_order::<u32>(&mut ctx).expect("seq");
                        seen.push((index, seq));
                    }
                    view.send(handle, b"ack").expect("reply");
                    seen
                })
            })
            .collect();

        accepted
            .iter()
            .zip(workers)
            .map(|(&handle, worker)| {
                let remote = server.remote_endpoint(handle).expect("live connection");
                (remote, worker.join().expect("worker panicked"))
            })
            .collect()
    });

    for (remote, seen) in &results {
        let (index, _) = seen[0];
        assert_eq!(clients[index as usize].0.local_endpoint().as_ref(), Some(remote));
        let expected: Vec<(u32, u32)> = (0..12).map(|seq| (index, seq)).collect();
        assert_eq!(seen, &expected);
    }
    assert!(server.pop_event().is_none());

    server.update()?;
    for (client, conn) in clients.iter_mut() {
        client.update()?;
        let event = client
            .pop_event_for_connection(*conn)
            .expect("ack from server");
        assert_eq!(client.payload(&event), b"ack");
    }
    Ok(())
}

#[test]
fn test_udp_loopback_handshake() -> Result<()> {
    tidenet_core::init();
    let loopback = NetworkEndPoint::parse_udp("127.0.0.1:0")?;

    let mut server = NetworkDriver::udp(NetworkConfig::default())?;
    server.bind(&loopback)?;
    server.listen()?;
    let server_addr = server.local_endpoint().expect("server bound");

    let mut client = NetworkDriver::udp(NetworkConfig::default())?;
    client.bind(&loopback)?;
    let conn = client.connect(&server_addr)?;

    let mut accepted = None;
    for _ in 0..200 {
        server.update()?;
        if accepted.is_none() {
            accepted = server.accept();
        }
        client.update()?;
        if client.connection_state(conn) == ConnectionState::Connected {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(client.connection_state(conn), ConnectionState::Connected);

    client.send(conn, b"over the wire")?;
    for _ in 0..200 {
        server.update()?;
        if accepted.is_none() {
            accepted = server.accept();
        }
        while let Some((handle, event)) = server.pop_event() {
            if event.kind == NetworkEventType::Data {
                assert_eq!(Some(handle), accepted);
                assert_eq!(server.payload(&event), b"over the wire");
                return Ok(());
            }
        }
        thread::sleep(Duration::from_millis(5));
    }
    bail!("server never saw the data packet")
}

#[test]
fn test_config_file_drives_timeouts() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    write!(
        file,
        r#"{{ "connect_timeout_ms": 50, "max_connect_attempts": 2 }}"#
    )?;
    let config = NetworkConfig::from_json_file(file.path())?;
    assert_eq!(config.disconnect_timeout_ms, 30_000);

    let hub = IpcHub::new();
    let clock = ManualClock::new(1_000);
    let mut client = ipc_driver(&hub, &clock, config)?;
    let nobody = hub.create_endpoint();
    let conn = client.connect(&nobody)?;

    clock.advance(51);
    assert_eq!(client.update()?, 0);
    clock.advance(51);
    assert_eq!(client.update()?, 1);

    let (handle, event) = client.pop_event().expect("disconnect event");
    assert_eq!(handle, conn);
    assert_eq!(event.kind, NetworkEventType::Disconnect);
    assert_eq!(client.statistics().packets_sent, 2);
    Ok(())
}
