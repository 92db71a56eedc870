use crate::Error;

/// Check that a buffer called `name` contains at least `required` elements
#[inline]
pub(crate) fn check_capacity(name: &'static str, required: usize, actual: usize) -> Result<(), Error> {
    if actual < required {
        return Err(Error::Capacity { name, required, actual });
    }
    return Ok(());
}

/// Split the first `size` elements of `buffer` out of it, returning them and
/// the remaining elements
#[inline]
pub(crate) fn take_mut<'a>(buffer: &mut &'a mut [f64], size: usize) -> &'a mut [f64] {
    let (head, tail) = std::mem::take(buffer).split_at_mut(size);
    *buffer = tail;
    return head;
}

/// Same as `take_mut` for immutable slices
#[inline]
pub(crate) fn take<'a>(buffer: &mut &'a [f64], size: usize) -> &'a [f64] {
    let (head, tail) = buffer.split_at(size);
    *buffer = tail;
    return head;
}

/// Get the `index`-th chunk of `size` elements in `buffer`
#[inline]
pub(crate) fn row(buffer: &[f64], index: usize, size: usize) -> &[f64] {
    &buffer[index * size..(index + 1) * size]
}

/// Mutable version of `row`
#[inline]
pub(crate) fn row_mut(buffer: &mut [f64], index: usize, size: usize) -> &mut [f64] {
    &mut buffer[index * size..(index + 1) * size]
}

#[inline]
pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// no usable forward pass
    Ready,
    /// a forward pass was run for this number of neighbors, optionally
    /// followed by a force pass with a full cache
    Forward { neighbors: usize, full_cache: bool, full_force: bool },
    /// the basis was shut down, all operations fail
    Shutdown,
}

/// Tracks which operations are valid on a basis, depending on the previous
/// calls
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    stage: Stage,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle { stage: Stage::Ready }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stage == Stage::Shutdown
    }

    pub fn shutdown(&mut self) {
        self.stage = Stage::Shutdown;
    }

    /// Lifecycle of a new reference to the same basis: the previous passes
    /// are not shared, but a shut down basis stays shut down
    pub fn for_reference(&self) -> Lifecycle {
        if self.is_shutdown() {
            return Lifecycle { stage: Stage::Shutdown };
        }
        return Lifecycle::new();
    }

    /// Check that the basis was not shut down
    pub fn check_alive(&self, operation: &str) -> Result<(), Error> {
        if self.is_shutdown() {
            return Err(Error::State(format!("can not call {} on a basis after shutdown", operation)));
        }
        return Ok(());
    }

    /// Start a new forward pass, invalidating the previous one
    pub fn start_forward(&mut self) -> Result<(), Error> {
        self.check_alive("forward")?;
        self.stage = Stage::Ready;
        return Ok(());
    }

    /// Record a successful forward pass
    pub fn forward_done(&mut self, neighbors: usize, full_cache: bool) {
        debug_assert!(self.stage != Stage::Shutdown);
        self.stage = Stage::Forward { neighbors, full_cache, full_force: false };
    }

    /// Record a successful force pass
    pub fn force_done(&mut self, full_cache: bool) {
        if let Stage::Forward { ref mut full_force, .. } = self.stage {
            *full_force = full_cache;
        }
    }

    /// Check that a forward pass was run with the same number of neighbors,
    /// and with the same cache mode if `full_cache` is `Some`.
    pub fn check_forward(&self, operation: &str, neighbors: usize, full_cache: Option<bool>) -> Result<(), Error> {
        match self.stage {
            Stage::Shutdown => Err(Error::State(format!(
                "can not call {} on a basis after shutdown", operation
            ))),
            Stage::Ready => Err(Error::State(format!(
                "{} requires a previous call to forward", operation
            ))),
            Stage::Forward { neighbors: previous, full_cache: previous_full, .. } => {
                if previous != neighbors {
                    return Err(Error::State(format!(
                        "{} was called with {} neighbors, but the previous forward used {}",
                        operation, neighbors, previous
                    )));
                }
                if let Some(full_cache) = full_cache {
                    if full_cache && !previous_full {
                        return Err(Error::State(format!(
                            "{} requires a forward pass with a full cache", operation
                        )));
                    }
                    if !full_cache && previous_full {
                        return Err(Error::State(format!(
                            "{} was called without full cache, but the previous forward used one", operation
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Check that a forward pass and a force pass, both with a full cache,
    /// were run with the same number of neighbors
    pub fn check_force(&self, operation: &str, neighbors: usize) -> Result<(), Error> {
        self.check_forward(operation, neighbors, Some(true))?;
        if let Stage::Forward { full_force: false, .. } = self.stage {
            return Err(Error::State(format!(
                "{} requires a previous call to forward_force with a full cache", operation
            )));
        }
        return Ok(());
    }
}

/// Grow-only buffers owned by a basis, used when the caller does not manage
/// the caches itself
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    forward: Vec<f64>,
    backward: Vec<f64>,
}

impl Workspace {
    /// Make sure the buffers can hold at least `forward` and `backward`
    /// elements, and get them
    pub fn prepare(&mut self, forward: usize, backward: usize) -> (&mut [f64], &mut [f64]) {
        if self.forward.len() < forward {
            self.forward.resize(forward, 0.0);
        }
        if self.backward.len() < backward {
            self.backward.resize(backward, 0.0);
        }
        return (&mut self.forward[..forward], &mut self.backward[..backward]);
    }
}
