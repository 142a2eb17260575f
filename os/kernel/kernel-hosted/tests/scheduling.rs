use kernel_core::{KernelConfig, Pid, Semaphore};
use kernel_hosted::{Host, HostConfig, tick};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn host() -> Host {
    Host::boot(HostConfig::default()).unwrap()
}

#[test]
fn waiters_are_woken_in_block_order() {
    let host = host();
    let sem = Arc::new(Semaphore::new(1));
    let order = Arc::new(Mutex::new(Vec::new()));
    sem.down(host.kernel());

    let children: Vec<Pid> = (0..3)
        .map(|_| {
            let (sem, order) = (Arc::clone(&sem), Arc::clone(&order));
            host.spawn(move |k| {
                sem.down(k);
                order.lock().unwrap().push(k.current_pid().unwrap());
                sem.up(k);
                0
            })
            .unwrap()
        })
        .collect();

    host.yield_now();
    assert_eq!(sem.value(host.kernel()), -3);
    assert_eq!(sem.waiters(host.kernel()).collect::<Vec<_>>(), children);

    sem.up(host.kernel());
    for child in &children {
        assert_eq!(host.waitpid(*child), Ok((*child, 0)));
    }
    assert_eq!(*order.lock().unwrap(), children);
    assert_eq!(sem.value(host.kernel()), 1);
}

#[test]
fn semaphore_bounds_concurrent_holders() {
    const UNITS: isize = 2;
    let host = host();
    let sem = Arc::new(Semaphore::new(UNITS));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<Pid> = (0..5)
        .map(|_| {
            let (sem, inside, peak) = (Arc::clone(&sem), Arc::clone(&inside), Arc::clone(&peak));
            host.spawn(move |k| {
                for _ in 0..3 {
                    sem.down(k);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    k.yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sem.up(k);
                    k.yield_now();
                }
                0
            })
            .unwrap()
        })
        .collect();

    for worker in workers {
        assert_eq!(host.waitpid(worker), Ok((worker, 0)));
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(sem.value(host.kernel()), UNITS);
}

#[test]
fn timer_ticks_rotate_ready_processes() {
    let host = host();
    let trace = Arc::new(Mutex::new(Vec::new()));

    let spin = |name: &'static str| {
        let trace = Arc::clone(&trace);
        move |k: &kernel_hosted::HostKernel| {
            for _ in 0..3 {
                trace.lock().unwrap().push(name);
                tick(k);
            }
            0
        }
    };
    let a = host.spawn(spin("a")).unwrap();
    let b = host.spawn(spin("b")).unwrap();

    assert_eq!(host.waitpid(a), Ok((a, 0)));
    assert_eq!(host.waitpid(b), Ok((b, 0)));
    assert_eq!(*trace.lock().unwrap(), ["a", "b", "a", "b", "a", "b"]);
    assert_eq!(host.ticks(), 6);
    assert_eq!(host.pic().acknowledged(0), 6);
}

#[test]
fn timer_preempts_init_too() {
    let host = host();
    let ran = Arc::new(AtomicUsize::new(0));
    let child = {
        let ran = Arc::clone(&ran);
        host.spawn(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            0
        })
        .unwrap()
    };
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    host.tick();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(host.current_pid(), Some(Pid::INIT));
    assert_eq!(host.waitpid(child), Ok((child, 0)));
}

#[test]
fn custom_timer_line() {
    let config = HostConfig::default().with_kernel(KernelConfig::new().with_timer_line(2));
    let host = Host::boot(config).unwrap();
    host.tick();
    assert_eq!(host.ticks(), 1);
    assert_eq!(host.pic().acknowledged(2), 1);
}

#[test]
fn timer_line_must_exist() {
    let config = HostConfig::default().with_kernel(KernelConfig::new().with_timer_line(99));
    assert!(Host::boot(config).is_err());
}

#[test]
#[should_panic(expected = "idle")]
fn blocking_with_nobody_to_wake_is_detected() {
    let host = Host::boot(HostConfig::default().with_idle_timeout(Duration::from_millis(50)))
        .unwrap();
    host.block();
}
