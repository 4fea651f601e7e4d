//! End-to-end tests for the allocator: cross-client sharing, deferred
//! reclamation under pressure, and concurrent allocate/free/share traffic.

use quarry::device::Device;
use quarry::flags::{BufferFlags, PAGE_SIZE};
use quarry::heaps::{CarveoutHeap, SystemHeap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn system_device() -> Arc<Device> {
    init_tracing();
    let device = Device::new();
    device
        .add_heap(Arc::new(SystemHeap::new(0, "system")))
        .unwrap();
    device
}

// ============================================================================
// Session basics
// ============================================================================

/// Allocate, look the handle up by id and by buffer, and see the bytes in
/// the heap report.
#[test]
fn test_allocate_lookup_and_usage() {
    init_tracing();
    let device = Device::new();
    device
        .add_heap(Arc::new(SystemHeap::new(0, "system").with_capacity(PAGE_SIZE)))
        .unwrap();
    let client = device.create_client("camera");

    let handle = client
        .allocate(PAGE_SIZE, PAGE_SIZE, 0b1, BufferFlags::empty())
        .unwrap();
    assert_eq!(client.lookup(handle.id()).unwrap().id(), handle.id());
    assert_eq!(
        client
            .lookup_by_buffer(handle.buffer().id())
            .unwrap()
            .id(),
        handle.id()
    );

    let report = device.heap_report(0).unwrap();
    assert_eq!(report.clients[0].bytes, PAGE_SIZE);
    assert_eq!(report.total_bytes, PAGE_SIZE);

    client.free(handle.id()).unwrap();
}

/// Handle ids are scoped to their client: another session can neither look
/// them up by id nor find the buffer in its own table.
#[test]
fn test_handles_invisible_across_clients() {
    let device = system_device();
    let a = device.create_client("a");
    let b = device.create_client("b");

    let handle = a
        .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
        .unwrap();

    assert!(b.lookup(handle.id()).is_err());
    assert!(b.lookup_by_buffer(handle.buffer().id()).is_none());
    assert!(b.free(handle.id()).is_err());
    assert_eq!(handle.buffer().handle_count(), 1);

    a.free(handle.id()).unwrap();
}

// ============================================================================
// Cross-client sharing
// ============================================================================

/// A shared buffer outlives the exporting client's handle and session; it
/// dies with the last reference, wherever that reference lives.
#[test]
fn test_shared_buffer_survives_exporter() {
    let device = system_device();

    let producer = device.create_client("producer");
    let consumer = device.create_client("consumer");

    let handle = producer
        .allocate(PAGE_SIZE * 4, PAGE_SIZE, 0b1, BufferFlags::empty())
        .unwrap();
    let buffer_id = handle.buffer().id();
    let token = producer.share(handle.id()).unwrap();

    let imported = consumer.import(&token).unwrap();
    assert_eq!(imported.buffer().id(), buffer_id);
    assert_eq!(imported.buffer().handle_count(), 2);
    drop(token);

    // Producer goes away entirely; the consumer still owns the buffer.
    producer.free(handle.id()).unwrap();
    drop(producer);
    assert_eq!(imported.buffer().handle_count(), 1);
    assert_eq!(device.live_buffers(), 1);

    let range = consumer.kernel_map(imported.id()).unwrap();
    assert_eq!(range.len(), PAGE_SIZE * 4);
    consumer.kernel_unmap(imported.id()).unwrap();

    consumer.free(imported.id()).unwrap();
    assert_eq!(device.live_buffers(), 0);
}

/// Importing a buffer twice into one client lands on one handle with two
/// references, and takes two frees to drop.
#[test]
fn test_repeated_import_deduplicates() {
    let device = system_device();
    let producer = device.create_client("producer");
    let consumer = device.create_client("consumer");

    let handle = producer
        .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
        .unwrap();
    let token = producer.share(handle.id()).unwrap();

    let first = consumer.import(&token).unwrap();
    let second = consumer.import(&token).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(consumer.handle_count(), 1);
    assert_eq!(first.ref_count(), 2);
    // One handle per client, however many imports: producer + consumer.
    assert_eq!(first.buffer().handle_count(), 2);

    consumer.free(first.id()).unwrap();
    assert_eq!(consumer.handle_count(), 1);
    consumer.free(first.id()).unwrap();
    assert_eq!(consumer.handle_count(), 0);

    drop(token);
    producer.free(handle.id()).unwrap();
    assert_eq!(device.live_buffers(), 0);
}

/// A client importing its own export gains a reference on the handle it
/// already holds instead of a second handle.
#[test]
fn test_self_import_bumps_existing_handle() {
    let device = system_device();
    let client = device.create_client("selfish");

    let handle = client
        .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
        .unwrap();
    let token = client.share(handle.id()).unwrap();

    let again = client.import(&token).unwrap();
    assert_eq!(again.id(), handle.id());
    assert_eq!(handle.ref_count(), 2);
    assert_eq!(client.handle_count(), 1);

    drop(token);
    client.free(handle.id()).unwrap();
    client.free(handle.id()).unwrap();
    assert_eq!(device.live_buffers(), 0);
}

// ============================================================================
// Deferred reclamation
// ============================================================================

/// On a full deferred-free heap, freed-but-not-yet-reclaimed memory is
/// recovered by the allocation path itself: drain and retry before failing.
#[test]
fn test_allocation_reclaims_deferred_memory_under_pressure() {
    init_tracing();
    let device = Device::new();
    device
        .add_heap(Arc::new(
            SystemHeap::new(0, "system")
                .with_capacity(PAGE_SIZE * 4)
                .with_deferred_free(),
        ))
        .unwrap();
    let client = device.create_client("pressure");

    // Fill the heap, then free everything; reclamation is asynchronous so
    // the memory may still be accounted to the queue.
    for _ in 0..32 {
        let handle = client
            .allocate(PAGE_SIZE * 4, 0, 0b1, BufferFlags::empty())
            .unwrap();
        client.free(handle.id()).unwrap();
    }

    // Even if every previous buffer is still queued, this allocation must
    // succeed via drain-and-retry.
    let handle = client
        .allocate(PAGE_SIZE * 4, 0, 0b1, BufferFlags::empty())
        .unwrap();
    client.free(handle.id()).unwrap();
}

/// An explicit drain reclaims queued memory without an allocation forcing
/// it.
#[test]
fn test_explicit_drain() {
    init_tracing();
    let device = Device::new();
    device
        .add_heap(Arc::new(SystemHeap::new(0, "system").with_deferred_free()))
        .unwrap();
    let client = device.create_client("drain");

    let handle = client
        .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
        .unwrap();
    client.free(handle.id()).unwrap();

    device.drain_deferred(0).unwrap();
    let report = device.heap_report(0).unwrap();
    assert_eq!(report.deferred_bytes, 0);
    assert_eq!(report.total_bytes, 0);
}

// ============================================================================
// Heap fallback
// ============================================================================

/// Allocations spill from a small contiguous carveout to system memory
/// when the carveout fills, and return once it drains.
#[test]
fn test_carveout_spills_to_system_heap() {
    init_tracing();
    let device = Device::new();
    device
        .add_heap(Arc::new(
            CarveoutHeap::new(1, "carveout", PAGE_SIZE * 2)
                .unwrap()
                .with_priority(10),
        ))
        .unwrap();
    device
        .add_heap(Arc::new(SystemHeap::new(0, "system").with_priority(1)))
        .unwrap();
    let client = device.create_client("fallback");
    let mask = 0b11;

    let a = client
        .allocate(PAGE_SIZE * 2, 0, mask, BufferFlags::empty())
        .unwrap();
    assert_eq!(a.buffer().heap().name(), "carveout");
    assert!(client.phys(a.id()).is_ok());

    let b = client
        .allocate(PAGE_SIZE * 2, 0, mask, BufferFlags::empty())
        .unwrap();
    assert_eq!(b.buffer().heap().name(), "system");

    client.free(a.id()).unwrap();
    let c = client
        .allocate(PAGE_SIZE * 2, 0, mask, BufferFlags::empty())
        .unwrap();
    assert_eq!(c.buffer().heap().name(), "carveout");

    client.free(b.id()).unwrap();
    client.free(c.id()).unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

/// Concurrent allocate/share/import/free traffic across threads and
/// clients leaves no buffers behind.
#[test]
fn test_concurrent_allocate_share_free() {
    let device = system_device();
    let num_threads = 8;
    let iterations = 200;
    let imports = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..num_threads)
        .map(|t| {
            let device = Arc::clone(&device);
            let imports = Arc::clone(&imports);
            thread::spawn(move || {
                let producer = device.create_client(&format!("producer-{t}"));
                let consumer = device.create_client(&format!("consumer-{t}"));
                for i in 0..iterations {
                    let len = PAGE_SIZE * (1 + i % 4);
                    let handle = producer
                        .allocate(len, 0, 0b1, BufferFlags::empty())
                        .unwrap();

                    if i % 3 == 0 {
                        let token = producer.share(handle.id()).unwrap();
                        let imported = consumer.import(&token).unwrap();
                        imports.fetch_add(1, Ordering::Relaxed);
                        drop(token);
                        consumer.free(imported.id()).unwrap();
                    }

                    producer.free(handle.id()).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(imports.load(Ordering::Relaxed) > 0);
    assert_eq!(device.live_buffers(), 0);
}

/// Kernel-mapping requests from many threads over one shared buffer leave
/// the mapping cache balanced.
#[test]
fn test_concurrent_kernel_mapping() {
    let device = system_device();
    let client = device.create_client("mapper");
    let handle = client
        .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
        .unwrap();
    let token = client.share(handle.id()).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let token = token.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let range = token.begin_cpu_access().unwrap();
                    assert_eq!(range.len(), PAGE_SIZE);
                    token.end_cpu_access();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(handle.buffer().kmap_count(), 0);
    drop(token);
    client.free(handle.id()).unwrap();
    assert_eq!(device.live_buffers(), 0);
}

/// Heap reports race session churn without stalling either side: the
/// report must never hold the topology lock while the last reference to a
/// session dies in its hands.
#[test]
fn test_heap_report_during_client_churn() {
    let device = system_device();

    let churn_device = Arc::clone(&device);
    let churn = thread::spawn(move || {
        for i in 0..300 {
            let client = churn_device.create_client(&format!("churn-{i}"));
            let handle = client
                .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
                .unwrap();
            client.free(handle.id()).unwrap();
        }
    });

    for _ in 0..300 {
        device.heap_report(0).unwrap();
    }

    churn.join().unwrap();
    assert_eq!(device.live_buffers(), 0);
}

/// A shared buffer can outlive the device that allocated it; once the
/// reclamation worker is gone, the final release frees inline.
#[test]
fn test_shared_buffer_outlives_device_teardown() {
    init_tracing();
    let heap = Arc::new(SystemHeap::new(0, "deferred").with_deferred_free());

    let token;
    {
        let device = Device::new();
        device.add_heap(heap.clone()).unwrap();
        let client = device.create_client("ephemeral");
        let handle = client
            .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
            .unwrap();
        token = client.share(handle.id()).unwrap();
        client.free(handle.id()).unwrap();
    }

    // Device, topology, and worker are gone; the token still owns the
    // memory.
    assert_eq!(heap.bytes_in_use(), PAGE_SIZE);
    drop(token);
    assert_eq!(heap.bytes_in_use(), 0);
}

/// Dropping a client mid-traffic force-frees its handles without touching
/// buffers other clients still reference.
#[test]
fn test_client_teardown_releases_only_its_references() {
    let device = system_device();
    let keeper = device.create_client("keeper");

    let transient = device.create_client("transient");
    let own = transient
        .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
        .unwrap();
    let shared = transient
        .allocate(PAGE_SIZE * 2, 0, 0b1, BufferFlags::empty())
        .unwrap();
    let token = transient.share(shared.id()).unwrap();
    let imported = keeper.import(&token).unwrap();
    drop(token);

    // `own` and `shared` are never freed explicitly; closing the session
    // force-frees them.
    let _ = own;
    drop(transient);

    assert_eq!(device.live_buffers(), 1);
    assert_eq!(keeper.handle_count(), 1);
    let range = keeper.kernel_map(imported.id()).unwrap();
    assert_eq!(range.len(), PAGE_SIZE * 2);
    keeper.kernel_unmap(imported.id()).unwrap();

    keeper.free(imported.id()).unwrap();
    assert_eq!(device.live_buffers(), 0);
}
