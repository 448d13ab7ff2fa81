/// Run `f` up to `max_attempts` times, returning the first success.
///
/// Intermediate failures are logged and retried; the last failure is returned
/// unchanged. Used for chunk reads from unreliable (network) storage.
pub fn attempt<T, E, F>(max_attempts: usize, mut f: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    debug_assert!(max_attempts > 0);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempts < max_attempts => {
                log::warn!("attempt {}/{} failed: {}; retrying", attempts, max_attempts, e);
            }
            Err(e) => return Err(e),
        }
    }
}
