//! Integration tests: read-block and write-block transfers.

use std::sync::Arc;

use pipedma::{
    BufferType, Completion, Config, ConfigBuilder, DescOp, DevId, DeviceInfo, DmaContext, Error,
    Family, Loopback, Notifier, ReadBlockEvent, ReadBlockReq, RingFamily, RingId, SessionId,
    WriteBlockReq,
};
use quickcheck::{Arbitrary, Gen, QuickCheck};

// ── Helpers ─────────────────────────────────────────────────────────

const DEV: DevId = DevId(0);

fn config(rb: (u32, u32), wb: (u32, u32)) -> Config {
    ConfigBuilder::new()
        .read_block_pool(rb.0, rb.1)
        .write_block_pool(wb.0, wb.1)
        .build()
        .unwrap()
}

fn setup(config: Config, info: DeviceInfo) -> (Arc<Loopback>, DmaContext) {
    let lb = Arc::new(Loopback::new(16));
    let ctx = DmaContext::new(config, lb.clone()).unwrap();
    ctx.add_device(DEV, info).unwrap();
    (lb, ctx)
}

fn free(ctx: &DmaContext, subdev: u8, ty: BufferType) -> u32 {
    ctx.dump(DEV).unwrap().pool(subdev, ty).unwrap().free
}

/// Entry `i` at `base + i * 8` holds eight copies of `i`.
fn fill_entries(lb: &Loopback, base: u64, n: u32) {
    for i in 0..n {
        lb.write_mem(DEV, base + i as u64 * 8, &[i as u8; 8]);
    }
}

fn check_partition(events: &[ReadBlockEvent], entries: u32) {
    let mut sorted: Vec<_> = events.iter().collect();
    sorted.sort_by_key(|e| e.offset);
    let mut next = 0;
    for e in sorted {
        assert_eq!(e.offset, next);
        assert!(!e.error);
        assert_eq!(e.data.len(), e.count as usize * 8);
        for (k, chunk) in e.data.chunks(8).enumerate() {
            assert_eq!(chunk, &[(e.offset as usize + k) as u8; 8]);
        }
        next += e.count;
    }
    assert_eq!(next, entries);
}

// ── Read block ──────────────────────────────────────────────────────

#[test]
fn read_block_partitions_entries() {
    let (lb, ctx) = setup(
        config((4, 64), (2, 128)),
        DeviceInfo::simple(Family::Gen1, 4, 12),
    );
    fill_entries(&lb, 0x1000, 20);
    let sess = ctx.open_session().unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    let req = ReadBlockReq {
        subdev: 0,
        entry_size: 8,
        entries: 20,
        step: 8,
        addr: 0x1000,
    };
    assert_eq!(
        ctx.read_block(sess, DEV, req, Notifier::channel(tx)).unwrap(),
        3
    );
    assert!(ctx.close_session(sess).is_err());

    ctx.service_device(DEV);
    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events.len(), 3);
    let counts: Vec<u32> = events.iter().map(|e| e.count).collect();
    assert_eq!(counts.iter().sum::<u32>(), 20);
    check_partition(&events, 20);

    assert!(ctx.dump(DEV).unwrap().sessions.is_empty());
    assert_eq!(free(&ctx, 0, BufferType::ReadBlock), 4);
    assert_eq!(ctx.session_stats(sess).unwrap().read_block_ops, 1);
    ctx.close_session(sess).unwrap();
}

#[test]
fn read_block_larger_than_pool_recycles_buffers() {
    let (lb, ctx) = setup(
        config((2, 64), (2, 128)),
        DeviceInfo::simple(Family::Gen1, 4, 12),
    );
    fill_entries(&lb, 0, 40);
    let sess = ctx.open_session().unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    let req = ReadBlockReq {
        subdev: 0,
        entry_size: 8,
        entries: 40,
        step: 8,
        addr: 0,
    };
    assert_eq!(
        ctx.read_block(sess, DEV, req, Notifier::channel(tx)).unwrap(),
        5
    );
    ctx.service_device(DEV);
    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events.len(), 5);
    check_partition(&events, 40);
    assert_eq!(free(&ctx, 0, BufferType::ReadBlock), 2);
    assert!(ctx.session_stats(sess).unwrap().pool_exhausted > 0);
}

#[test]
fn read_block_reports_device_errors() {
    let (lb, ctx) = setup(
        config((4, 64), (2, 128)),
        DeviceInfo::simple(Family::Gen1, 4, 12),
    );
    let sess = ctx.open_session().unwrap();
    lb.error_next_completions(1);
    let (tx, rx) = crossbeam_channel::unbounded();
    let req = ReadBlockReq {
        subdev: 0,
        entry_size: 4,
        entries: 4,
        step: 4,
        addr: 0,
    };
    ctx.read_block(sess, DEV, req, Notifier::channel(tx)).unwrap();
    ctx.service_device(DEV);
    assert!(rx.try_recv().unwrap().error);
    assert_eq!(ctx.session_stats(sess).unwrap().read_block_errors, 1);
}

#[test]
fn read_completion_on_other_subdevice_is_dropped() {
    let info = DeviceInfo {
        family: Family::Gen2,
        subdevices: 2,
        pipes_per_subdevice: 2,
        stages: 12,
        logical_to_physical: (0..4).collect(),
    };
    let (lb, ctx) = setup(config((4, 64), (2, 128)), info);
    fill_entries(&lb, 0x1000, 4);
    let sess = ctx.open_session().unwrap();
    lb.set_hold(true);
    let (tx, rx) = crossbeam_channel::unbounded();
    let req = ReadBlockReq {
        subdev: 0,
        entry_size: 8,
        entries: 4,
        step: 8,
        addr: 0x1000,
    };
    ctx.read_block(sess, DEV, req, Notifier::channel(tx)).unwrap();
    let id = lb.posted()[0].msg_id;

    let stray = RingId::new(RingFamily::ReadBlock, 1, 0);
    lb.inject(
        DEV,
        stray,
        Completion {
            msg_id: id,
            error: false,
            data: None,
        },
    );
    assert_eq!(ctx.service_device(DEV), 1);
    assert!(rx.try_recv().is_err());

    lb.release_held();
    ctx.service_device(DEV);
    let events: Vec<ReadBlockEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    check_partition(&events, 4);
    ctx.close_session(sess).unwrap();
}

#[test]
fn block_past_end_of_address_space_rejected() {
    let (lb, ctx) = setup(
        config((4, 64), (2, 128)),
        DeviceInfo::simple(Family::Gen1, 4, 12),
    );
    let sess = ctx.open_session().unwrap();
    let read = ReadBlockReq {
        subdev: 0,
        entry_size: 8,
        entries: 4,
        step: 8,
        addr: u64::MAX - 16,
    };
    assert!(matches!(
        ctx.read_block(sess, DEV, read, Notifier::callback(|_| {})),
        Err(Error::InvalidArgument(_))
    ));
    let write = WriteBlockReq {
        entry_size: 4,
        entries: 2,
        step: u32::MAX,
        addr: u64::MAX - u32::MAX as u64,
        pipe_mask: 0b1,
        payload: &[0; 4],
        single: false,
    };
    assert!(matches!(
        ctx.write_block(sess, DEV, write, None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(lb.posted().is_empty());
    assert_eq!(ctx.session_stats(sess).unwrap().read_block_ops, 0);
    assert_eq!(free(&ctx, 0, BufferType::ReadBlock), 4);
    assert_eq!(free(&ctx, 0, BufferType::WriteBlock), 2);

    // The last byte may sit at the very top.
    let read = ReadBlockReq {
        addr: u64::MAX - 31,
        ..read
    };
    ctx.read_block(sess, DEV, read, Notifier::callback(|_| {}))
        .unwrap();
    ctx.service_device(DEV);
    ctx.close_session(sess).unwrap();
}

// ── Write block ─────────────────────────────────────────────────────

#[test]
fn write_block_waits_for_every_pipe() {
    let (lb, ctx) = setup(
        config((2, 64), (2, 512)),
        DeviceInfo::simple(Family::Gen2, 4, 12),
    );
    let sessions: Vec<SessionId> = (0..4).map(|_| ctx.open_session().unwrap()).collect();
    let sess = sessions[3];
    assert_eq!(sess, SessionId(3));

    let (tx, rx) = crossbeam_channel::unbounded();
    let req = WriteBlockReq {
        entry_size: 4,
        entries: 100,
        step: 4,
        addr: 0x2000,
        pipe_mask: 0b0101,
        payload: &[1, 2, 3, 4],
        single: false,
    };
    ctx.write_block(sess, DEV, req, Some(Notifier::channel(tx)))
        .unwrap();

    let posted = lb.posted();
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[0].msg_id, posted[1].msg_id);
    assert_eq!((posted[0].msg_id >> 40) & 0xFFFF, 3);
    let rings: Vec<RingId> = posted.iter().map(|p| p.ring).collect();
    assert_eq!(
        rings,
        vec![
            RingId::new(RingFamily::WriteBlock, 0, 0),
            RingId::new(RingFamily::WriteBlock, 0, 2),
        ]
    );
    assert_eq!(posted[0].data.len(), 400);
    assert!(matches!(
        posted[0].op,
        DescOp::WriteBlock {
            pipe_mask: 0b0101,
            entries: 100,
            ..
        }
    ));
    assert_eq!(free(&ctx, 0, BufferType::WriteBlock), 1);

    ctx.service_ring(DEV, rings[0]);
    assert!(rx.try_recv().is_err());
    assert_eq!(free(&ctx, 0, BufferType::WriteBlock), 1);

    ctx.service_ring(DEV, rings[1]);
    let event = rx.try_recv().unwrap();
    assert_eq!(event.pipe_mask, 0b0101);
    assert!(!event.error);
    assert_eq!(free(&ctx, 0, BufferType::WriteBlock), 2);
    assert_eq!(lb.read_mem(DEV, 0x2000 + 99 * 4, 4), vec![1, 2, 3, 4]);
}

#[test]
fn single_entry_write_is_replicated_by_device() {
    let (lb, ctx) = setup(
        config((2, 64), (2, 128)),
        DeviceInfo::simple(Family::Gen2, 2, 12),
    );
    let sess = ctx.open_session().unwrap();
    let req = WriteBlockReq {
        entry_size: 8,
        entries: 64,
        step: 8,
        addr: 0,
        pipe_mask: 0b11,
        payload: &[7; 8],
        single: true,
    };
    ctx.write_block(sess, DEV, req, None).unwrap();
    assert_eq!(lb.posted()[0].data.len(), 8);
    ctx.service_device(DEV);
    assert_eq!(lb.read_mem(DEV, 63 * 8, 8), vec![7; 8]);
    assert_eq!(free(&ctx, 0, BufferType::WriteBlock), 2);
    ctx.close_session(sess).unwrap();
}

#[test]
fn ring_full_gives_up_after_bound() {
    let config = ConfigBuilder::new()
        .write_block_pool(2, 128)
        .ring_full_retries(3)
        .build()
        .unwrap();
    let lb = Arc::new(Loopback::new(1));
    let ctx = DmaContext::new(config, lb.clone()).unwrap();
    ctx.add_device(DEV, DeviceInfo::simple(Family::Gen1, 2, 12))
        .unwrap();
    let sess = ctx.open_session().unwrap();
    lb.set_hold(true);

    let req = WriteBlockReq {
        entry_size: 4,
        entries: 1,
        step: 4,
        addr: 0x40,
        pipe_mask: 0b1,
        payload: &[9; 4],
        single: false,
    };
    ctx.write_block(sess, DEV, req, None).unwrap();
    assert!(matches!(
        ctx.write_block(sess, DEV, req, None),
        Err(Error::TryAgain)
    ));
    assert_eq!(ctx.session_stats(sess).unwrap().ring_full_retries, 3);
    assert_eq!(free(&ctx, 0, BufferType::WriteBlock), 1);

    lb.release_held();
    ctx.service_device(DEV);
    assert_eq!(free(&ctx, 0, BufferType::WriteBlock), 2);
    ctx.close_session(sess).unwrap();
}

// ── Write mask clearing across layouts ──────────────────────────────

#[derive(Clone, Debug)]
struct Layout {
    subdevices: u8,
    pipes_per_subdevice: u8,
    reversed: bool,
    mask: u32,
    order: Vec<u8>,
}

impl Arbitrary for Layout {
    fn arbitrary(g: &mut Gen) -> Self {
        let subdevices = 1 + u8::arbitrary(g) % 2;
        let pipes_per_subdevice = 1 + u8::arbitrary(g) % 4;
        let pipes = subdevices as u32 * pipes_per_subdevice as u32;
        let mut mask = u32::arbitrary(g) & ((1 << pipes) - 1);
        if mask == 0 {
            mask = 1;
        }
        Layout {
            subdevices,
            pipes_per_subdevice,
            reversed: bool::arbitrary(g),
            mask,
            order: Vec::arbitrary(g),
        }
    }
}

/// Completions in any order clear the write mask exactly once each, and
/// the operation finishes only after the last targeted pipe reports.
fn write_mask_clears(layout: Layout) -> bool {
    let pipes = layout.subdevices * layout.pipes_per_subdevice;
    let mut map: Vec<u8> = (0..pipes).collect();
    if layout.reversed {
        map.reverse();
    }
    let info = DeviceInfo {
        family: Family::Gen3,
        subdevices: layout.subdevices,
        pipes_per_subdevice: layout.pipes_per_subdevice,
        stages: 12,
        logical_to_physical: map.clone(),
    };
    let (_lb, ctx) = setup(config((1, 64), (1, 64)), info.clone());
    let sess = ctx.open_session().unwrap();
    let phys = info.physical_mask(layout.mask).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let req = WriteBlockReq {
        entry_size: 4,
        entries: 4,
        step: 4,
        addr: 0,
        pipe_mask: layout.mask,
        payload: &[5; 4],
        single: false,
    };
    if ctx
        .write_block(sess, DEV, req, Some(Notifier::channel(tx)))
        .is_err()
    {
        return false;
    }

    let mut targets: Vec<u32> = (0..32).filter(|p| phys & (1 << p) != 0).collect();
    // Shuffle deterministically from the generated order.
    for (i, k) in layout.order.iter().enumerate() {
        let a = i % targets.len();
        let b = *k as usize % targets.len();
        targets.swap(a, b);
    }

    let owner = info.locate_pipe(phys.trailing_zeros()).0;
    let mut ok = true;
    for (n, pipe) in targets.iter().enumerate() {
        ok &= rx.try_recv().is_err();
        let (sd, idx) = info.locate_pipe(*pipe);
        ok &= ctx.service_ring(DEV, RingId::new(RingFamily::WriteBlock, sd, idx)) == 1;
        if n + 1 < targets.len() {
            ok &= free(&ctx, owner, BufferType::WriteBlock) == 0;
        }
    }
    match rx.try_recv() {
        Ok(event) => ok &= event.pipe_mask == phys && !event.error,
        Err(_) => ok = false,
    }
    ok && rx.try_recv().is_err()
        && free(&ctx, owner, BufferType::WriteBlock) == 1
        && ctx.close_session(sess).is_ok()
}

#[test]
fn prop_write_mask_clears() {
    QuickCheck::new()
        .tests(100)
        .quickcheck(write_mask_clears as fn(Layout) -> bool);
}
