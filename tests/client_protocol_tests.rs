use bombuh::bus::{request, transmit, VirtualBus};
use bombuh::client::{BombClient, ClientError, RequestPool, REQUEST_POOL_LIMIT};
use bombuh::hash::hash_id;
use bombuh::transport::ServiceOrder;

#[derive(Default)]
struct App {
    events: Vec<(u8, Vec<u8>)>,
    responses: Vec<Vec<u8>>,
}

fn client() -> BombClient<App> {
    let mut client = BombClient::new(App::default(), ServiceOrder::Fifo);
    client
        .add_event_dispatcher(|app: &mut App, _: &mut RequestPool<App>, id: u8, data: &[u8]| {
            app.events.push((id, data.to_vec()));
        })
        .unwrap();
    client.set_handshake_handler(|_: &mut App| vec![0x01, 0x02]);
    client.attach(0x30);
    client
}

/// Reads one framed reply the way the master does: prolog first, then the content.
fn read_reply(client: &mut BombClient<App>, bus: &mut VirtualBus) -> Vec<u8> {
    let prolog = request(client, bus, 3);
    assert_eq!(prolog[0], 0xFE, "bad prolog {:02x?}", prolog);
    let mut remaining = usize::from(u16::from_le_bytes([prolog[1], prolog[2]]));
    let mut content = Vec::new();
    while remaining > 0 {
        let chunk = request(client, bus, remaining.min(32));
        assert!(!chunk.is_empty());
        remaining -= chunk.len();
        content.extend(chunk);
    }
    content
}

#[test]
fn test_discovery_probe_is_answered() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    transmit(&mut client, &mut bus, &[0xEA]);
    assert_eq!(request(&mut client, &mut bus, 1), vec![0xAE]);
    assert_eq!(client.stats().discovery_probes, 1);
    // Answered once only.
    assert!(request(&mut client, &mut bus, 1).is_empty());
}

#[test]
fn test_handshake_reply_carries_check_code_and_capabilities() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    transmit(&mut client, &mut bus, &[0xFE, 0x01, 0x00, 0x04]);

    assert_eq!(request(&mut client, &mut bus, 3), vec![0xFE, 8, 0]);
    assert_eq!(request(&mut client, &mut bus, 8), b"Julka\0\x01\x02".to_vec());
}

#[test]
fn test_event_dispatch_and_empty_reply() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    transmit(&mut client, &mut bus, &[0xFE, 0x03, 0x00, 0x03, 0x05, 0xAA]);

    assert_eq!(client.app().events, vec![(5, vec![0xAA])]);
    assert_eq!(request(&mut client, &mut bus, 3), vec![0xFE, 0, 0]);
    assert!(request(&mut client, &mut bus, 3).is_empty());
    assert_eq!(client.stats().events_dispatched, 1);
}

#[test]
fn test_poll_then_response_resolves_slot() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    let slot = client
        .queue_request("GetClock", vec![9], |app: &mut App, _: &mut RequestPool<App>, data: &[u8]| {
            app.responses.push(data.to_vec());
        })
        .unwrap();
    assert_eq!(slot, 0);

    transmit(&mut client, &mut bus, &[0xFE, 0x01, 0x00, 0x01]);
    let mut expected = vec![1, 0];
    expected.extend_from_slice(&hash_id("GetClock").to_le_bytes());
    expected.extend_from_slice(&[1, 0, 9]);
    assert_eq!(read_reply(&mut client, &mut bus), expected);
    assert!(!client.is_all_sync_done());

    transmit(&mut client, &mut bus, &[0xFE, 0x04, 0x00, 0x02, 0x00, 0x10, 0x20]);
    assert_eq!(client.app().responses, vec![vec![0x10, 0x20]]);
    assert!(client.is_all_sync_done());
    // RESPONSE gets no reply.
    assert!(request(&mut client, &mut bus, 3).is_empty());
}

#[test]
fn test_empty_poll_reports_zero_requests() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    transmit(&mut client, &mut bus, &[0xFE, 0x01, 0x00, 0x01]);
    assert_eq!(read_reply(&mut client, &mut bus), vec![0]);
}

#[test]
fn test_invalid_start_byte_is_dropped() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    transmit(&mut client, &mut bus, &[0x00, 0x01, 0x00, 0x04]);
    assert!(request(&mut client, &mut bus, 3).is_empty());
    assert_eq!(client.stats().packets_rejected, 1);

    // The next well-formed packet is handled normally.
    transmit(&mut client, &mut bus, &[0xFE, 0x01, 0x00, 0x04]);
    assert_eq!(request(&mut client, &mut bus, 3), vec![0xFE, 8, 0]);
}

#[test]
fn test_unknown_command_gets_no_reply() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    transmit(&mut client, &mut bus, &[0xFE, 0x01, 0x00, 0x09]);
    assert!(request(&mut client, &mut bus, 3).is_empty());
    assert_eq!(client.stats().packets_rejected, 1);
}

#[test]
fn test_packet_split_over_several_transactions() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    let data: Vec<u8> = (0..40).collect();
    let mut packet = vec![0xFE, 42, 0, 0x03, 0x07];
    packet.extend_from_slice(&data);

    transmit(&mut client, &mut bus, &packet);
    assert_eq!(client.app().events, vec![(7, data)]);
}

#[test]
fn test_large_reply_is_chunked() {
    let mut client = BombClient::new(App::default(), ServiceOrder::Fifo);
    client.set_handshake_handler(|_: &mut App| vec![0x55; 40]);
    let mut bus = VirtualBus::new();
    transmit(&mut client, &mut bus, &[0xFE, 0x01, 0x00, 0x04]);

    assert_eq!(request(&mut client, &mut bus, 3), vec![0xFE, 46, 0]);
    assert_eq!(request(&mut client, &mut bus, 32).len(), 32);
    assert_eq!(request(&mut client, &mut bus, 32).len(), 14);
}

#[test]
fn test_pool_overflow_is_reported() {
    let mut client = client();
    for _ in 0..REQUEST_POOL_LIMIT {
        client.queue_simple("AddStrike").unwrap();
    }
    assert!(matches!(
        client.queue_simple("AddStrike"),
        Err(ClientError::RequestPoolFull(_))
    ));
    assert_eq!(client.requests().outstanding(), REQUEST_POOL_LIMIT);
}

#[test]
fn test_out_of_range_response_is_ignored() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    client.queue_simple("AddStrike").unwrap();
    transmit(&mut client, &mut bus, &[0xFE, 0x02, 0x00, 0x02, 0x08]);
    assert_eq!(client.requests().outstanding(), 1);
    assert_eq!(client.stats().responses_handled, 0);
}

#[test]
fn test_discarded_requests_are_not_polled() {
    let mut client = client();
    let mut bus = VirtualBus::new();
    client.queue_simple("GetStrikes").unwrap();
    client.discard_requests();
    assert!(client.is_all_sync_done());

    transmit(&mut client, &mut bus, &[0xFE, 0x01, 0x00, 0x01]);
    assert_eq!(read_reply(&mut client, &mut bus), vec![0]);
}
