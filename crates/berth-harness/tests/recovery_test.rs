use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use berth_harness::recovery::panic_message;
use berth_harness::spawn_guarded;

#[tokio::test]
async fn normal_task_returns_output() {
    let handle = spawn_guarded("adder", async { 2 + 2 });
    assert_eq!(handle.await.unwrap(), Some(4));
}

#[tokio::test]
async fn panicking_task_is_contained() {
    let handle = spawn_guarded("boom", async {
        panic!("reader exploded");
    });
    let joined: Option<()> = handle.await.expect("join never sees the panic");
    assert_eq!(joined, None);
}

#[tokio::test]
async fn siblings_keep_running_after_a_panic() {
    let counter = Arc::new(AtomicUsize::new(0));
    let bad = spawn_guarded("bad", async {
        panic!("nope");
    });
    let good = {
        let counter = counter.clone();
        spawn_guarded("good", async move {
            for _ in 0..3 {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let _ = bad.await;
    good.await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn panic_message_handles_common_payloads() {
    let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
    assert_eq!(panic_message(owned.as_ref()), "owned");
    let borrowed: Box<dyn std::any::Any + Send> = Box::new("static");
    assert_eq!(panic_message(borrowed.as_ref()), "static");
    let other: Box<dyn std::any::Any + Send> = Box::new(7u8);
    assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
}
