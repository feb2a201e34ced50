use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::Inline;
use crate::possibility::Possibility;
use crate::promise::Promise;

struct Gather<T> {
    slots: Vec<Possibility<T>>,
    remaining: usize,
}

/// A promise that resolves once every input has resolved.
///
/// The result holds one possibility per input, in input order: the value for
/// accepted inputs, the error for rejected ones. The combined promise never
/// rejects. An empty input resolves immediately with an empty vector.
///
/// Firing the combined promise is not required; the inputs are observed
/// right away, which also fires any lazy inputs.
pub fn when_all<T>(promises: Vec<Promise<T>>) -> Promise<Vec<Possibility<T>>>
where
    T: Clone + Send + 'static,
{
    let combined = Promise::named("when_all");
    if promises.is_empty() {
        combined.accept(Vec::new());
        return combined;
    }

    let gather = Arc::new(Mutex::new(Gather {
        slots: promises.iter().map(|_| Possibility::Empty).collect(),
        remaining: promises.len(),
    }));

    for (index, promise) in promises.into_iter().enumerate() {
        let on_success = {
            let gather = Arc::clone(&gather);
            let combined = combined.clone();
            move |value: T| record(&gather, &combined, index, Possibility::Value(value))
        };
        let on_failure = {
            let gather = Arc::clone(&gather);
            let combined = combined.clone();
            move |err| record(&gather, &combined, index, Possibility::Error(err))
        };
        promise.then_on(on_success, on_failure, Arc::new(Inline));
    }
    combined
}

fn record<T: Clone + Send + 'static>(
    gather: &Mutex<Gather<T>>,
    combined: &Promise<Vec<Possibility<T>>>,
    index: usize,
    outcome: Possibility<T>,
) {
    let finished = {
        let mut gather = gather.lock();
        gather.slots[index] = outcome;
        gather.remaining -= 1;
        (gather.remaining == 0).then(|| std::mem::take(&mut gather.slots))
    };
    if let Some(results) = finished {
        combined.accept(results);
    }
}
