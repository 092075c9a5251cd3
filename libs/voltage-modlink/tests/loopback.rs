//! Client, server and proxy talking over loopback TCP

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use voltage_modlink::{
    Coil, ConnectionState, DeviceHandler, DeviceIdentificationCategory, DeviceIdentity,
    HoldingRegister, LinkConfig, ModbusClient, ModbusError, ModbusProtocol, ModbusTcpServer,
    ProtocolKind, ProxyHandler, RegisterStore, RequestHandler, TransportError,
    WriteNotification,
};
use voltage_modlink::CancellationToken;

fn identity() -> DeviceIdentity {
    let mut identity = DeviceIdentity::basic("Voltage", "VM-1", "2.1").unwrap();
    identity.set_object(0x05, "Loopback").unwrap();
    for id in 0x80..0x88u8 {
        identity.set_object(id, vec![id; 50]).unwrap();
    }
    identity
}

async fn start_server(
    protocol: ProtocolKind,
    handler: Arc<dyn RequestHandler>,
) -> (SocketAddr, CancellationToken) {
    let server = ModbusTcpServer::bind("127.0.0.1:0", protocol.create(), handler)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = server.cancellation_token();
    tokio::spawn(server.run());
    (addr, cancel)
}

fn client_config(protocol: ProtocolKind, addr: SocketAddr) -> LinkConfig {
    let mut config = LinkConfig::tcp(protocol, addr.ip().to_string(), addr.port());
    config.read_timeout_ms = 500;
    config.connect_timeout_ms = Some(2000);
    config
}

async fn start_device(
    protocol: ProtocolKind,
) -> (Arc<RegisterStore>, SocketAddr, CancellationToken) {
    let store = Arc::new(RegisterStore::new(identity()));
    store.add_unit(1);
    let handler: Arc<dyn RequestHandler> = Arc::new(DeviceHandler::new(store.clone()));
    let (addr, cancel) = start_server(protocol, handler).await;
    (store, addr, cancel)
}

#[tokio::test]
async fn test_tcp_client_against_simulated_device() {
    let store = Arc::new(RegisterStore::new(identity()));
    store.add_unit(1);
    store.set_input_register(1, 30, 0xABCD);
    store.set_discrete_input(1, 2, true);
    let (handler, mut writes) = DeviceHandler::with_notifications(store.clone());
    let (addr, cancel) = start_server(ProtocolKind::Tcp, Arc::new(handler)).await;

    let client = ModbusClient::from_config(&client_config(ProtocolKind::Tcp, addr)).unwrap();

    let coils = [Coil::new(10, true), Coil::new(11, false), Coil::new(12, true)];
    assert!(client.write_multiple_coils(1, &coils).await.unwrap());
    let read = client.read_coils(1, 10, 3).await.unwrap();
    assert_eq!(read, coils.to_vec());
    assert_eq!(
        writes.recv().await,
        Some(WriteNotification::Coils {
            unit_id: 1,
            coils: coils.to_vec()
        })
    );

    assert!(client
        .write_single_holding_register(1, HoldingRegister::new(100, 4242))
        .await
        .unwrap());
    let registers = client.read_holding_registers(1, 99, 2).await.unwrap();
    assert_eq!(registers[0].value(), 0);
    assert_eq!(registers[1].value(), 4242);

    let inputs = client.read_input_registers(1, 30, 1).await.unwrap();
    assert_eq!(inputs[0].value(), 0xABCD);
    let discrete = client.read_discrete_inputs(1, 0, 3).await.unwrap();
    assert_eq!(
        discrete.iter().map(|d| d.value).collect::<Vec<_>>(),
        vec![false, false, true]
    );

    client.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_rtu_framing_over_tcp_socket() {
    let (store, addr, cancel) = start_device(ProtocolKind::Rtu).await;
    store.set_holding_register(1, 0, 0x0102);

    let client = ModbusClient::from_config(&client_config(ProtocolKind::Rtu, addr)).unwrap();
    let registers = client.read_holding_registers(1, 0, 1).await.unwrap();
    assert_eq!(registers[0].value(), 0x0102);

    // Register reads past the address space are refused locally
    assert!(matches!(
        client.read_holding_registers(1, 0xFFFF, 2).await,
        Err(ModbusError::OutOfRange(_))
    ));

    client.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_device_identification_pagination() {
    let (_, addr, cancel) = start_device(ProtocolKind::Tcp).await;
    let client = ModbusClient::from_config(&client_config(ProtocolKind::Tcp, addr)).unwrap();

    let first = client
        .read_device_identification_raw(1, DeviceIdentificationCategory::Extended, 0)
        .await
        .unwrap();
    assert!(first.more_requests_needed);
    let second = client
        .read_device_identification_raw(
            1,
            DeviceIdentificationCategory::Extended,
            first.next_object_id_to_request,
        )
        .await
        .unwrap();
    assert!(!second.more_requests_needed);

    // No duplicates, no gaps
    let ids: Vec<u8> = first
        .objects
        .iter()
        .chain(second.objects.iter())
        .map(|(id, _)| *id)
        .collect();
    let expected: Vec<u8> = [0x00, 0x01, 0x02, 0x05].into_iter().chain(0x80..0x88).collect();
    assert_eq!(ids, expected);

    let full = client
        .read_device_identification(1, DeviceIdentificationCategory::Regular)
        .await
        .unwrap();
    assert_eq!(full.model_name.as_deref(), Some("Loopback"));
    assert!(full.extended_objects.is_empty());

    let single = client
        .read_device_identification_raw(1, DeviceIdentificationCategory::Individual, 0x02)
        .await
        .unwrap();
    assert_eq!(single.objects, vec![(0x02, b"2.1".to_vec())]);

    let missing = client
        .read_device_identification_raw(1, DeviceIdentificationCategory::Individual, 0x06)
        .await
        .unwrap_err();
    assert_eq!(
        missing.exception_code(),
        Some(voltage_modlink::ExceptionCode::IllegalDataAddress)
    );

    client.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_ascii_proxy_in_front_of_tcp_device() {
    let (store, backend_addr, backend_cancel) = start_device(ProtocolKind::Tcp).await;
    store.set_holding_register(1, 7, 77);

    let backend_config = client_config(ProtocolKind::Tcp, backend_addr);
    let backend = ModbusClient::from_config(&backend_config).unwrap();
    let proxy: Arc<dyn RequestHandler> = Arc::new(ProxyHandler::new(backend.clone()));
    let (front_addr, front_cancel) = start_server(ProtocolKind::Ascii, proxy).await;

    // Outlasts the backend read timeout so the proxy's exception reply arrives
    let mut front_config = client_config(ProtocolKind::Ascii, front_addr);
    front_config.read_timeout_ms = 2000;
    let client = ModbusClient::from_config(&front_config).unwrap();
    let registers = client.read_holding_registers(1, 7, 1).await.unwrap();
    assert_eq!(registers[0].value(), 77);

    assert!(client.write_single_coil(1, Coil::new(4, true)).await.unwrap());
    assert_eq!(store.read_coils(1, 4, 1), Some(vec![true]));

    let identification = client
        .read_device_identification(1, DeviceIdentificationCategory::Extended)
        .await
        .unwrap();
    assert_eq!(identification.vendor_name.as_deref(), Some("Voltage"));
    assert_eq!(identification.extended_objects.len(), 8);

    // The backend answers nothing for unit 9: the proxy turns its timeout into an exception
    let err = client.read_coils(9, 0, 1).await.unwrap_err();
    assert_eq!(
        err.exception_code(),
        Some(voltage_modlink::ExceptionCode::SlaveDeviceFailure)
    );

    client.close().await;
    backend.close().await;
    front_cancel.cancel();
    backend_cancel.cancel();
}

#[tokio::test]
async fn test_idle_close_and_transparent_reconnect() {
    let (_, addr, cancel) = start_device(ProtocolKind::Tcp).await;
    let mut config = client_config(ProtocolKind::Tcp, addr);
    config.idle_timeout_ms = 150;
    let client = ModbusClient::from_config(&config).unwrap();

    client.read_coils(1, 0, 1).await.unwrap();
    assert_eq!(client.connection().state(), ConnectionState::Connected);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.connection().state(), ConnectionState::Disconnected);

    client.read_coils(1, 0, 1).await.unwrap();
    assert_eq!(client.connection().state(), ConnectionState::Connected);

    client.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_silent_unit_times_out_and_caller_timeout_abandons() {
    let (_, addr, cancel) = start_device(ProtocolKind::Tcp).await;
    let client = ModbusClient::from_config(&client_config(ProtocolKind::Tcp, addr)).unwrap();

    let err = client.read_coils(42, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Transport(TransportError::Timeout(_))));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), client.read_coils(42, 0, 1)).await;
    assert!(abandoned.is_err());

    // The link recovers for the next caller
    client.read_coils(1, 0, 1).await.unwrap();

    client.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_caller_token_cancels_typed_read_in_flight() {
    let (_, addr, cancel) = start_device(ProtocolKind::Tcp).await;
    let client = ModbusClient::from_config(&client_config(ProtocolKind::Tcp, addr)).unwrap();

    let token = CancellationToken::new();
    let scoped = client.with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    // Unit 42 never answers; the token fires well before the read timeout
    let err = scoped.read_input_registers(42, 0, 1).await.unwrap_err();
    assert_eq!(err, ModbusError::Cancelled);
    canceller.await.unwrap();

    // The owning client is unaffected and the link recovers
    let registers = client.read_input_registers(1, 0, 1).await.unwrap();
    assert_eq!(registers[0].value(), 0);

    client.close().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_unreachable_backend_gives_up_after_connect_timeout() {
    // Bind then drop to get a port nobody listens on
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = client_config(ProtocolKind::Tcp, addr);
    config.connect_timeout_ms = Some(300);
    config.reconnect_min_delay_ms = 50;
    let client = ModbusClient::from_config(&config).unwrap();

    let err = client.read_coils(1, 0, 1).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(client.connection().state(), ConnectionState::Disconnected);
    client.close().await;

    let err = client.read_coils(1, 0, 1).await.unwrap_err();
    assert_eq!(err, ModbusError::Disposed);
}

#[tokio::test]
async fn test_raw_invoke_forwards_framed_bytes() {
    let (store, addr, cancel) = start_device(ProtocolKind::Tcp).await;
    store.set_holding_register(1, 3, 0x0A0B);
    let client = ModbusClient::from_config(&client_config(ProtocolKind::Tcp, addr)).unwrap();

    let request = client
        .protocol()
        .serialize_read_holding_registers(1, 3, 1)
        .unwrap();
    let reply = client
        .invoke_raw(request.clone(), &CancellationToken::new())
        .await
        .unwrap();
    client.protocol().validate_response(&request, &reply).unwrap();
    assert_eq!(&reply[9..], &[0x0A, 0x0B]);

    client.close().await;
    cancel.cancel();
}
