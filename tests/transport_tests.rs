use bombuh::bus::VirtualBus;
use bombuh::promise::{Promise, Response};
use bombuh::transport::{AsyncI2c, I2cContext, ReadLocation, ServiceOrder, SlaveBus};

struct Device {
    i2c: AsyncI2c<Device>,
    completed: Vec<(&'static str, Vec<u8>)>,
}

impl I2cContext for Device {
    fn i2c(&mut self) -> &mut AsyncI2c<Self> {
        &mut self.i2c
    }
}

impl Device {
    fn new(order: ServiceOrder) -> Self {
        Self {
            i2c: AsyncI2c::new(order),
            completed: Vec::new(),
        }
    }
}

fn record(tag: &'static str, promise: Promise<Device>) -> Promise<Device> {
    promise.finally(move |device: &mut Device, response: &mut Response| {
        device.completed.push((tag, response.as_bytes().to_vec()));
    })
}

#[test]
fn test_fifo_reads_take_bytes_in_submission_order() {
    let mut device = Device::new(ServiceOrder::Fifo);
    let mut bus = VirtualBus::new();
    AsyncI2c::submit(&mut device, record("three", Promise::read(3)));
    AsyncI2c::submit(&mut device, record("five", Promise::read(5)));

    bus.master_write(&[0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(AsyncI2c::handle_receive(&mut device, &mut bus, 8), 8);

    assert_eq!(
        device.completed,
        vec![("three", vec![0, 1, 2]), ("five", vec![3, 4, 5, 6, 7])]
    );
    assert!(!device.i2c.is_receiving());
}

#[test]
fn test_lifo_reads_serve_newest_first() {
    let mut device = Device::new(ServiceOrder::Lifo);
    let mut bus = VirtualBus::new();
    AsyncI2c::submit(&mut device, record("three", Promise::read(3)));
    AsyncI2c::submit(&mut device, record("five", Promise::read(5)));

    bus.master_write(&[0, 1, 2, 3, 4, 5, 6, 7]);
    AsyncI2c::handle_receive(&mut device, &mut bus, 8);

    assert_eq!(
        device.completed,
        vec![("five", vec![0, 1, 2, 3, 4]), ("three", vec![5, 6, 7])]
    );
}

#[test]
fn test_partial_fills_span_transactions() {
    let mut device = Device::new(ServiceOrder::Fifo);
    let mut bus = VirtualBus::new();
    AsyncI2c::submit(&mut device, record("four", Promise::read(4)));
    AsyncI2c::submit(&mut device, record("two", Promise::read(2)));

    bus.master_write(&[10, 11, 12]);
    assert_eq!(AsyncI2c::handle_receive(&mut device, &mut bus, 3), 3);
    assert!(device.completed.is_empty());
    assert_eq!(device.i2c.pending_reads(), 2);

    bus.master_write(&[13, 20, 21]);
    assert_eq!(AsyncI2c::handle_receive(&mut device, &mut bus, 3), 3);
    assert_eq!(
        device.completed,
        vec![("four", vec![10, 11, 12, 13]), ("two", vec![20, 21])]
    );
}

#[test]
fn test_unclaimed_bytes_stay_on_the_bus() {
    let mut device = Device::new(ServiceOrder::Fifo);
    let mut bus = VirtualBus::new();
    AsyncI2c::submit(&mut device, record("two", Promise::read(2)));

    bus.master_write(&[1, 2, 3, 4]);
    assert_eq!(AsyncI2c::handle_receive(&mut device, &mut bus, 4), 2);
    assert_eq!(bus.available(), 2);
}

#[test]
fn test_read_chain_queues_follow_up_read_from_same_bytes() {
    let mut device = Device::new(ServiceOrder::Fifo);
    let mut bus = VirtualBus::new();
    let length_prefixed = Promise::read_temp(1).then(|_: &mut Device, len: &mut Response| {
        Some(Promise::read(usize::from(len.as_bytes()[0])))
    });
    AsyncI2c::submit(&mut device, record("body", length_prefixed));

    bus.master_write(&[3, 7, 8, 9]);
    assert_eq!(AsyncI2c::handle_receive(&mut device, &mut bus, 4), 4);
    assert_eq!(device.completed, vec![("body", vec![7, 8, 9])]);
}

#[test]
fn test_heap_read_hands_buffer_over() {
    let mut device = Device::new(ServiceOrder::Fifo);
    let mut bus = VirtualBus::new();
    let taken = Promise::read(40).finally(|device: &mut Device, response: &mut Response| {
        assert_eq!(response.location(), Some(ReadLocation::Heap));
        let bytes = response.take();
        device.completed.push(("taken", bytes));
    });
    AsyncI2c::submit(&mut device, taken);

    let data: Vec<u8> = (0..40).collect();
    bus.master_write(&data[..32]);
    AsyncI2c::handle_receive(&mut device, &mut bus, 32);
    bus.master_write(&data[32..]);
    AsyncI2c::handle_receive(&mut device, &mut bus, 8);

    assert_eq!(device.completed, vec![("taken", data)]);
}

#[test]
fn test_writes_drain_one_entry_per_master_read() {
    let mut device = Device::new(ServiceOrder::Fifo);
    let mut bus = VirtualBus::new();
    AsyncI2c::submit(&mut device, record("first", Promise::write(vec![1, 2])));
    AsyncI2c::submit(&mut device, record("second", Promise::write(vec![3])));

    bus.begin_master_read();
    assert_eq!(AsyncI2c::handle_request(&mut device, &mut bus), 2);
    assert_eq!(bus.take_transmitted(), vec![1, 2]);

    bus.begin_master_read();
    assert_eq!(AsyncI2c::handle_request(&mut device, &mut bus), 1);
    assert_eq!(bus.take_transmitted(), vec![3]);

    let tags: Vec<_> = device.completed.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["first", "second"]);
}

#[test]
fn test_ready_promise_resolves_on_submit() {
    let mut device = Device::new(ServiceOrder::Fifo);
    AsyncI2c::submit(&mut device, record("now", Promise::ready()));
    assert_eq!(device.completed, vec![("now", Vec::new())]);
    assert_eq!(device.i2c.pending_reads(), 0);
}

#[test]
fn test_clear_drops_pending_without_running_continuations() {
    let mut device = Device::new(ServiceOrder::Fifo);
    AsyncI2c::submit(&mut device, record("read", Promise::read(4)));
    AsyncI2c::submit(&mut device, record("write", Promise::write(vec![1])));
    device.i2c.clear();

    assert_eq!(device.i2c.pending_reads(), 0);
    assert_eq!(device.i2c.pending_writes(), 0);
    assert!(device.completed.is_empty());
}
