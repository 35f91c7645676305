use rand::Rng;
use std::sync::Arc;
use wavefront::{operators, GraphError, ReadableNode, Source, WritableNode};

const N_SOURCES: usize = 10;
const N_WRITER_OPS: usize = 200;
const N_READER_OPS: usize = 200;

#[derive(Debug)]
enum WriteOp {
    Set(usize, i32),
}

#[derive(Debug, Clone, Copy)]
enum ReadOp {
    ReadSource(usize),
    ReadSum,
    ReadScan,
}

impl rand::distributions::Distribution<WriteOp> for rand::distributions::Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> WriteOp {
        let key = rng.gen_range(0..N_SOURCES);
        let value = rng.gen_range(0..100);
        WriteOp::Set(key, value)
    }
}

impl rand::distributions::Distribution<ReadOp> for rand::distributions::Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> ReadOp {
        match rng.gen_range(0..3) {
            0 => ReadOp::ReadSource(rng.gen_range(0..N_SOURCES)),
            1 => ReadOp::ReadSum,
            _ => ReadOp::ReadScan,
        }
    }
}

/// Spins up a small graph (`N_SOURCES` roots feeding a `combine`-style sum
/// and a `scan` over the first source), then hammers it with concurrent
/// writer and reader threads. There is no "expected final value" to check
/// mid-flight — writers race freely — the property under test is that no
/// thread panics, deadlocks, or observes a torn/partial read.
pub fn stress_test() {
    let sources: Vec<Source<i32>> = (0..N_SOURCES).map(|_| Source::new(0)).collect();

    let sum = {
        let mut it = sources.iter().cloned();
        let first = it.next().unwrap();
        it.fold(operators::map(first, |v: i32| Ok::<_, GraphError>(v)), |acc, next| {
            operators::combine2(acc, next, |a: i32, b: i32| Ok::<_, GraphError>(a + b))
        })
    };
    let scan = operators::scan(sources[0].clone(), 0i64, |state: &i64, v: i32| state + v as i64);

    // Keep both derived nodes "observed" for the duration of the stress
    // run, matching the demand-driven registration contract.
    let _sum_sub = sum.subscribe(Arc::new(|_| {}));
    let _scan_sub = scan.subscribe(Arc::new(|_| {}));

    let mut rng = rand::thread_rng();
    let write_ops: Vec<WriteOp> = (0..N_WRITER_OPS).map(|_| rng.gen()).collect();
    let read_ops: Vec<ReadOp> = (0..N_READER_OPS).map(|_| rng.gen()).collect();

    let mut handles = Vec::new();

    {
        let sources = sources.clone();
        handles.push(std::thread::spawn(move || {
            for op in write_ops {
                match op {
                    WriteOp::Set(key, value) => sources[key].write(value),
                }
            }
        }));
    }

    for chunk in read_ops.chunks(N_READER_OPS / 4 + 1) {
        let sources = sources.clone();
        let sum = sum.clone();
        let scan = scan.clone();
        let chunk = chunk.to_vec();
        handles.push(std::thread::spawn(move || {
            for op in chunk {
                match op {
                    ReadOp::ReadSource(key) => {
                        let _ = sources[key].read();
                    }
                    ReadOp::ReadSum => {
                        let _ = sum.read();
                    }
                    ReadOp::ReadScan => {
                        let _ = scan.read();
                    }
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    // Quiescent consistency: once every writer has finished, a fresh read
    // of `sum` must equal the plain arithmetic sum of the sources.
    let expected: i32 = sources.iter().map(|s| s.read().unwrap()).sum();
    assert_eq!(sum.read().unwrap(), expected);
}
