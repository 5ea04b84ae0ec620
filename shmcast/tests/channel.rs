//! Single-process tests of the publish/subscribe protocol. Publishers and
//! subscribers share the region through separate mappings, exactly as they
//! would across processes.

use std::{
    thread,
    time::{Duration, Instant},
};

use shmcast::{
    shm::Region, AttachError, ConsumeError, CreateError, ImuSample, PublishError, Publisher,
    RegionError, Subscriber,
};

const WAIT: Option<Duration> = Some(Duration::from_millis(100));

fn unique(tag: &str) -> String {
    format!("/shmcast-{}-{tag}", std::process::id())
}

#[test]
fn late_joiner_starts_at_latest_value() -> anyhow::Result<()> {
    let name = unique("late-joiner");
    let publisher = Publisher::<u64>::create(&name, 10)?;
    for value in 0..=12 {
        publisher.publish(value)?;
    }

    let mut subscriber = Subscriber::<u64>::attach(&name)?;
    subscriber.connect()?;
    publisher.publish(13)?;
    publisher.publish(14)?;

    assert_eq!(subscriber.consume(WAIT)?, 12);
    assert_eq!(subscriber.consume(WAIT)?, 13);
    assert_eq!(subscriber.consume(WAIT)?, 14);
    assert_eq!(subscriber.try_consume(), Err(ConsumeError::Empty));
    Ok(())
}

#[test]
fn write_index_wraps_around() -> anyhow::Result<()> {
    let name = unique("wrap");
    let publisher = Publisher::<u32>::create(&name, 10)?;
    for n in 1..=25u32 {
        publisher.publish(n)?;
        assert_eq!(publisher.write_index()?, n as usize % 10);
    }
    assert_eq!(publisher.published()?, 25);
    Ok(())
}

#[test]
fn payload_is_copied_intact() -> anyhow::Result<()> {
    let name = unique("imu");
    let publisher = Publisher::<ImuSample>::create(&name, 4)?;
    let mut subscriber = Subscriber::<ImuSample>::attach(&name)?;
    subscriber.connect()?;

    let sample = ImuSample::new(42, "imu_link");
    publisher.publish(sample)?;
    assert_eq!(subscriber.consume(WAIT)?, sample);
    Ok(())
}

#[test]
fn concurrent_publishers_are_serialized() -> anyhow::Result<()> {
    let name = unique("concurrent");
    let publisher = Publisher::<u64>::create(&name, 7)?;

    thread::scope(|s| {
        for worker in 0..4u64 {
            let publisher = &publisher;
            s.spawn(move || {
                for i in 0..250 {
                    publisher.publish(worker * 1000 + i).unwrap();
                }
            });
        }
    });

    assert_eq!(publisher.published()?, 1000);
    assert_eq!(publisher.write_index()?, 1000 % 7);
    Ok(())
}

#[test]
fn readers_consume_independently() -> anyhow::Result<()> {
    let name = unique("independent");
    let publisher = Publisher::<u32>::create(&name, 8)?;
    let mut fast = Subscriber::<u32>::attach(&name)?;
    let mut slow = Subscriber::<u32>::attach(&name)?;
    fast.connect()?;
    slow.connect()?;
    assert_ne!(fast.reader_id(), slow.reader_id());
    assert_eq!(publisher.readers()?, 2);

    for value in 1..=3 {
        publisher.publish(value)?;
    }

    for value in 1..=3 {
        assert_eq!(fast.consume(WAIT)?, value);
    }
    assert_eq!(fast.try_consume(), Err(ConsumeError::Empty));

    publisher.publish(4)?;
    for value in 1..=4 {
        assert_eq!(slow.consume(WAIT)?, value);
    }
    assert_eq!(fast.consume(WAIT)?, 4);
    Ok(())
}

#[test]
fn lapped_reader_skips_to_oldest_value() -> anyhow::Result<()> {
    let name = unique("lapped");
    let publisher = Publisher::<u64>::create(&name, 4)?;
    let mut subscriber = Subscriber::<u64>::attach(&name)?;
    subscriber.connect()?;

    for value in 0..14 {
        publisher.publish(value)?;
    }

    for value in 10..14 {
        assert_eq!(subscriber.consume(WAIT)?, value);
    }
    assert_eq!(subscriber.overruns(), 10);
    assert_eq!(subscriber.try_consume(), Err(ConsumeError::Empty));
    Ok(())
}

#[test]
fn timeouts_are_honored() -> anyhow::Result<()> {
    let name = unique("timeout");
    let _publisher = Publisher::<u64>::create(&name, 2)?;
    let mut subscriber = Subscriber::<u64>::attach(&name)?;

    let start = Instant::now();
    assert_eq!(subscriber.try_consume(), Err(ConsumeError::Empty));
    assert!(start.elapsed() < Duration::from_millis(50));

    let timeout = Duration::from_millis(60);
    let start = Instant::now();
    assert_eq!(subscriber.consume(Some(timeout)), Err(ConsumeError::Empty));
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(200));
    Ok(())
}

#[test]
fn unbounded_wait_is_woken_by_publish() -> anyhow::Result<()> {
    let name = unique("unbounded");
    let publisher = Publisher::<u64>::create(&name, 2)?;
    let mut subscriber = Subscriber::<u64>::attach(&name)?;
    subscriber.connect()?;

    let waiter = thread::spawn(move || subscriber.consume(None));
    thread::sleep(Duration::from_millis(50));
    publisher.publish(7)?;

    assert_eq!(waiter.join().unwrap(), Ok(7));
    Ok(())
}

#[test]
fn pending_values_drain_before_shutdown() -> anyhow::Result<()> {
    let name = unique("drain");
    let publisher = Publisher::<u32>::create(&name, 4)?;
    let mut subscriber = Subscriber::<u32>::attach(&name)?;
    subscriber.connect()?;

    publisher.publish(1)?;
    publisher.publish(2)?;
    publisher.shutdown()?;
    assert_eq!(publisher.publish(3), Err(PublishError::Shutdown));

    assert_eq!(subscriber.consume(WAIT), Ok(1));
    assert_eq!(subscriber.consume(WAIT), Ok(2));
    assert_eq!(subscriber.consume(WAIT), Err(ConsumeError::Shutdown));
    assert!(subscriber.is_closed());
    assert_eq!(subscriber.reader_id(), None);
    assert_eq!(subscriber.consume(WAIT), Err(ConsumeError::Shutdown));
    assert_eq!(publisher.readers()?, 0);
    Ok(())
}

#[test]
fn shutdown_wakes_blocked_subscribers() -> anyhow::Result<()> {
    let name = unique("wake-all");
    let publisher = Publisher::<u32>::create(&name, 8)?;
    let mut subscribers = (0..3)
        .map(|_| {
            let mut subscriber = Subscriber::<u32>::attach(&name)?;
            subscriber.connect()?;
            Ok::<_, anyhow::Error>(subscriber)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let received = thread::scope(|s| {
        let handles: Vec<_> = subscribers
            .iter_mut()
            .map(|subscriber| {
                s.spawn(move || {
                    let mut values = Vec::new();
                    loop {
                        match subscriber.consume(None) {
                            Ok(value) => values.push(value),
                            Err(err) => return (values, err),
                        }
                    }
                })
            })
            .collect();

        publisher.publish(1).unwrap();
        publisher.publish(2).unwrap();
        thread::sleep(Duration::from_millis(50));
        publisher.shutdown().unwrap();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    for (values, err) in received {
        assert_eq!(values, [1, 2]);
        assert_eq!(err, ConsumeError::Shutdown);
    }
    assert_eq!(publisher.readers()?, 0);
    Ok(())
}

#[test]
fn dropping_the_publisher_closes_subscribers() -> anyhow::Result<()> {
    let name = unique("dropped");
    let publisher = Publisher::<u32>::create(&name, 4)?;
    let mut subscriber = Subscriber::<u32>::attach(&name)?;
    subscriber.connect()?;
    publisher.publish(9)?;
    drop(publisher);

    assert_eq!(subscriber.consume(WAIT), Ok(9));
    assert_eq!(subscriber.consume(WAIT), Err(ConsumeError::Shutdown));
    assert!(matches!(
        Subscriber::<u32>::attach(&name),
        Err(AttachError::Missing { .. })
    ));
    Ok(())
}

#[test]
fn type_mismatch_is_fatal() -> anyhow::Result<()> {
    let name = unique("mismatch");
    let _publisher = Publisher::<u64>::create(&name, 2)?;

    let err = Subscriber::<u32>::attach(&name).unwrap_err();
    assert!(matches!(err, AttachError::TypeMismatch { .. }));
    assert!(!err.is_retryable());
    assert!(matches!(
        Subscriber::<u32>::new(&name),
        Err(AttachError::TypeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn missing_channel_is_attached_lazily() -> anyhow::Result<()> {
    let name = unique("lazy");
    assert!(matches!(
        Subscriber::<u64>::attach(&name),
        Err(AttachError::Missing { .. })
    ));

    let mut subscriber = Subscriber::<u64>::new(&name)?;
    assert!(!subscriber.is_attached());
    let err = subscriber.try_consume().unwrap_err();
    assert!(matches!(err, ConsumeError::Attach(AttachError::Missing { .. })));
    assert!(!err.is_permanent());

    let publisher = Publisher::<u64>::create(&name, 4)?;
    publisher.publish(5)?;
    assert_eq!(subscriber.try_consume(), Ok(5));
    assert!(subscriber.is_attached());
    Ok(())
}

#[test]
fn registry_holds_32_readers() -> anyhow::Result<()> {
    let name = unique("full");
    let publisher = Publisher::<u8>::create(&name, 2)?;

    let mut subscribers = Vec::new();
    for _ in 0..shmcast::MAX_READERS {
        let mut subscriber = Subscriber::<u8>::attach(&name)?;
        subscriber.connect()?;
        subscribers.push(subscriber);
    }
    assert_eq!(publisher.readers()?, 32);

    let mut extra = Subscriber::<u8>::attach(&name)?;
    assert_eq!(extra.connect(), Err(ConsumeError::RegistryFull));
    assert_eq!(extra.try_consume(), Err(ConsumeError::RegistryFull));

    let freed = subscribers.swap_remove(5).reader_id();
    assert_eq!(publisher.readers()?, 31);
    assert_eq!(extra.connect()?, freed.unwrap());
    Ok(())
}

#[test]
fn name_is_reusable_after_drop() -> anyhow::Result<()> {
    let name = unique("reuse");
    let first = Publisher::<u64>::create(&name, 2)?;

    match Publisher::<u64>::create(&name, 2) {
        Err(CreateError::InUse { pid, .. }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected InUse, got {other:?}"),
    }

    drop(first);
    let second = Publisher::<u64>::create(&name, 3)?;
    assert_eq!(second.capacity(), 3);
    Ok(())
}

#[test]
fn shut_down_channel_is_reclaimed() -> anyhow::Result<()> {
    let name = unique("reclaim");
    let old = Publisher::<u64>::create(&name, 2)?;
    let mut old_subscriber = Subscriber::<u64>::attach(&name)?;
    old_subscriber.connect()?;
    old.shutdown()?;

    let new = Publisher::<u64>::create(&name, 2)?;
    assert_eq!(old_subscriber.try_consume(), Err(ConsumeError::Shutdown));

    drop(old);
    let mut subscriber = Subscriber::<u64>::attach(&name)?;
    subscriber.connect()?;
    new.publish(1)?;
    assert_eq!(subscriber.consume(WAIT)?, 1);
    Ok(())
}

#[test]
fn truncated_region_is_replaced() -> anyhow::Result<()> {
    let name = unique("truncated");
    let junk = Region::create(&name, 16)?;

    let publisher = Publisher::<u64>::create(&name, 2)?;
    drop(junk);

    let mut subscriber = Subscriber::<u64>::attach(&name)?;
    subscriber.connect()?;
    publisher.publish(3)?;
    assert_eq!(subscriber.consume(WAIT)?, 3);
    Ok(())
}

#[test]
fn invalid_arguments_are_rejected() {
    assert_eq!(
        Publisher::<u64>::create("", 2).unwrap_err(),
        CreateError::Region(RegionError::EmptyName)
    );
    assert_eq!(
        Publisher::<u64>::create(&unique("zero"), 0).unwrap_err(),
        CreateError::ZeroCapacity
    );
    assert_eq!(
        Publisher::<u64>::create(&unique("huge"), usize::MAX).unwrap_err(),
        CreateError::TooLarge {
            capacity: usize::MAX
        }
    );
}
