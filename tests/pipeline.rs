use indumpco::pipeline::{parallel_pipe, OutputSlot};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

#[derive(Debug, PartialEq, Eq, Clone)]
struct PipeError(&'static str);

static JOBS: [u64; 10] = [3, 15, 1, 9, 2, 8, 5, 3, 4, 7];

fn sleepy_worker(slot: OutputSlot<u64>, job: u64) -> Result<(), PipeError> {
    sleep(Duration::from_millis(job * 10));
    slot.deposit(job);
    Ok(())
}

fn faulty_worker(slot: OutputSlot<u64>, job: u64) -> Result<(), PipeError> {
    if job == 99 {
        return Err(PipeError("worker died"));
    }
    if job == 0 {
        return Err(PipeError("job after the failure made it to a worker"));
    }
    sleepy_worker(slot, job)
}

#[test]
fn results_arrive_in_source_order() {
    for workers in [1, 2, 4, 8] {
        let results: Vec<u64> = parallel_pipe(JOBS.iter().copied().map(Ok), sleepy_worker, workers)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(results, JOBS, "with {workers} workers");
    }
}

#[test]
fn worker_error_reaches_consumer() {
    for workers in [1, 2] {
        let err = parallel_pipe(vec![1u64, 99, 3].into_iter().map(Ok), faulty_worker, workers)
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert_eq!(err, PipeError("worker died"), "with {workers} workers");
    }
}

#[test]
fn first_worker_error_wins_under_load() {
    let mut jobs: Vec<u64> = vec![1, 2, 3, 4, 5, 6, 7, 8, 99, 3, 4, 5, 6, 7];
    jobs.extend(std::iter::repeat(0).take(13));
    let err = parallel_pipe(jobs.into_iter().map(Ok), faulty_worker, 4)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_err();
    assert_eq!(err, PipeError("worker died"));
}

#[test]
fn source_error_reaches_consumer() {
    for workers in [1, 2] {
        let source = vec![Ok(1u64), Ok(2), Ok(3), Err(PipeError("source died"))];
        let outcome: Vec<Result<u64, PipeError>> =
            parallel_pipe(source.into_iter(), sleepy_worker, workers).collect();
        assert_eq!(outcome.last(), Some(&Err(PipeError("source died"))));
        assert_eq!(outcome.iter().filter(|item| item.is_err()).count(), 1);
    }
}

#[test]
fn zero_deposit_slots_can_be_filled_by_another_worker() {
    // Only one worker at a time does real work; the others enqueue their
    // slot and job for it and return without depositing.
    struct DelegateState {
        running: bool,
        jobs: Vec<(OutputSlot<u64>, u64)>,
    }

    for workers in [1, 2, 4, 8] {
        let state = Arc::new(Mutex::new(DelegateState { running: false, jobs: Vec::new() }));
        let worker = {
            let state = Arc::clone(&state);
            move |slot: OutputSlot<u64>, job: u64| -> Result<(), PipeError> {
                {
                    let mut st = state.lock().unwrap();
                    st.jobs.push((slot, job));
                    if st.running {
                        return Ok(()); // the active worker will fill our slot
                    }
                    st.running = true;
                }
                loop {
                    let batch = {
                        let mut st = state.lock().unwrap();
                        if st.jobs.is_empty() {
                            st.running = false;
                            return Ok(());
                        }
                        std::mem::take(&mut st.jobs)
                    };
                    for (slot, job) in batch {
                        sleep(Duration::from_millis(job * 10));
                        slot.deposit(job);
                    }
                }
            }
        };
        let results: Vec<u64> = parallel_pipe(JOBS.iter().copied().map(Ok), worker, workers)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(results, JOBS, "with {workers} workers");
    }
}
