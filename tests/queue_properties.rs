use meshgate::message::MessagePriority;
use meshgate::queue::{BoundedPriorityQueue, QueueEntry};
use tokio_test::{assert_err, assert_ok};

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn priority(&mut self) -> MessagePriority {
        MessagePriority::DESCENDING[(self.next() % 4) as usize]
    }
}

#[test]
fn zero_capacity_is_rejected() {
    assert_err!(BoundedPriorityQueue::<u32>::new(0));
    assert_ok!(BoundedPriorityQueue::<u32>::new(1));
}

#[test]
fn drain_is_urgency_ordered_and_fifo_within_level() {
    let mut rng = Lcg(7);
    let mut queue = BoundedPriorityQueue::new(1000).unwrap();
    for seq in 0..300u32 {
        let p = rng.priority();
        queue.enqueue(QueueEntry::new(seq, p), p);
    }

    let drained: Vec<(MessagePriority, u32)> =
        std::iter::from_fn(|| queue.dequeue().map(|e| (e.priority, e.payload))).collect();
    assert_eq!(drained.len(), 300);
    for pair in drained.windows(2) {
        let ((p1, s1), (p2, s2)) = (pair[0], pair[1]);
        assert!(p1 >= p2, "urgency increased: {:?} then {:?}", p1, p2);
        if p1 == p2 {
            assert!(s1 < s2, "FIFO broken within {:?}: {} then {}", p1, s1, s2);
        }
    }
}

#[test]
fn size_stays_bounded_and_counters_balance() {
    let mut rng = Lcg(42);
    let mut queue = BoundedPriorityQueue::new(8).unwrap();
    for seq in 0..500u32 {
        if rng.next() % 3 == 0 {
            queue.dequeue();
        } else {
            let p = rng.priority();
            assert!(queue.push(seq, p));
        }
        let stats = queue.statistics();
        assert!(stats.size <= 8);
        assert_eq!(
            stats.enqueued,
            stats.dequeued + stats.dropped + stats.size as u64,
            "counters out of balance: {:?}",
            stats
        );
        assert_eq!(
            stats.emergency + stats.high + stats.normal + stats.low,
            stats.size
        );
    }
}

#[test]
fn emergency_traffic_survives_a_flood_of_low_priority() {
    let mut queue = BoundedPriorityQueue::new(4).unwrap();
    queue.push("sos", MessagePriority::Emergency);
    for i in 0..50 {
        queue.push(if i % 2 == 0 { "chatter" } else { "noise" }, MessagePriority::Low);
    }
    assert_eq!(queue.statistics().dropped, 47);
    assert_eq!(queue.dequeue().map(|e| e.payload), Some("sos"));
    assert_eq!(queue.len(), 3);
}
