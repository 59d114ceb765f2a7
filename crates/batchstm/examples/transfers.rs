use batchstm::{Region, Tx};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

// Concurrent bank transfers over a shared region.
//
// Each account is one 8-byte word. Every transfer is a transaction: read
// two balances, write two balances, commit. Conflicting transfers abort
// and retry, so the total balance is preserved no matter how the epochs
// interleave.

const ACCOUNTS: usize = 16;
const INITIAL_BALANCE: u64 = 1_000;
const THREADS: usize = 4;
const TRANSFERS_PER_THREAD: usize = 10_000;

fn read_account(region: &Region, tx: Tx, account: usize) -> Option<u64> {
    let mut bytes = [0u8; 8];
    // SAFETY: `account < ACCOUNTS`, private 8-byte destination.
    let ok = unsafe { region.read(tx, region.start().add(account * 8), 8, bytes.as_mut_ptr()) };
    ok.then(|| u64::from_ne_bytes(bytes))
}

fn write_account(region: &Region, tx: Tx, account: usize, balance: u64) -> bool {
    let bytes = balance.to_ne_bytes();
    // SAFETY: `account < ACCOUNTS`, 8-byte source.
    unsafe { region.write(tx, bytes.as_ptr(), 8, region.start().add(account * 8)) }
}

/// Move `amount` from one account to another. Returns `false` when the
/// transaction aborted (the caller retries with a fresh one).
fn transfer(region: &Region, from: usize, to: usize, amount: u64) -> bool {
    let tx = region.begin(false);

    let Some(source) = read_account(region, tx, from) else { return false };
    let Some(target) = read_account(region, tx, to) else { return false };
    if source < amount {
        // Nothing to move; an empty transaction still ends cleanly.
        return region.end(tx);
    }
    if !write_account(region, tx, from, source - amount) {
        return false;
    }
    if !write_account(region, tx, to, target + amount) {
        return false;
    }
    region.end(tx)
}

fn total_balance(region: &Region) -> u64 {
    let ro = region.begin(true);
    let total = (0..ACCOUNTS)
        .map(|account| read_account(region, ro, account).expect("read-only reads never abort"))
        .sum();
    region.end(ro);
    total
}

fn main() {
    println!("batchstm transfer example");
    println!("=========================\n");
    println!("Accounts: {}", ACCOUNTS);
    println!("Threads: {}", THREADS);
    println!("Transfers per thread: {}\n", TRANSFERS_PER_THREAD);

    let region = Arc::new(Region::new(ACCOUNTS * 8, 8).unwrap());

    // Seed every account in one transaction.
    let tx = region.begin(false);
    for account in 0..ACCOUNTS {
        assert!(write_account(&region, tx, account, INITIAL_BALANCE));
    }
    assert!(region.end(tx));

    let aborts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..THREADS)
        .map(|id| {
            let region = Arc::clone(&region);
            let aborts = Arc::clone(&aborts);
            thread::spawn(move || {
                // A deterministic walk over account pairs; different strides
                // per thread so transfers collide regularly.
                for i in 0..TRANSFERS_PER_THREAD {
                    let from = (i * (id + 1)) % ACCOUNTS;
                    let to = (from + id + 1) % ACCOUNTS;
                    if from == to {
                        continue;
                    }
                    while !transfer(&region, from, to, 1 + (i % 5) as u64) {
                        aborts.fetch_add(1, Ordering::Relaxed);
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed();
    let committed = THREADS * TRANSFERS_PER_THREAD;
    let total = total_balance(&region);

    println!("Committed transfers: {}", committed);
    println!("Aborted attempts: {}", aborts.load(Ordering::Relaxed));
    println!("Elapsed: {:.2?}", elapsed);
    println!(
        "Throughput: {:.0} transfers/sec",
        committed as f64 / elapsed.as_secs_f64()
    );
    println!("\nTotal balance: {} (expected {})", total, ACCOUNTS as u64 * INITIAL_BALANCE);
    assert_eq!(total, ACCOUNTS as u64 * INITIAL_BALANCE);
    println!("Balance preserved across all interleavings.");
}
