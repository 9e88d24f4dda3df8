//! Convenience macros for timing memory operations

/// Create a [`crate::performance::PerformanceSpan`] guard, optionally
/// attaching fields to its debug span.
///
/// The span stays entered for as long as the returned guard lives.
///
/// ```rust
/// use lattice_tracing::perf_span;
///
/// {
///     let _span = perf_span!("duplicate", bytes = 4096);
///     // ... copy ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::in_span(
            $name,
            None,
            tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Run a block and return `(result, duration_us)`.
///
/// ```rust
/// use lattice_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::trace!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_perf_span_macro_with_fields() {
        let span = perf_span!("copy", bytes = 1024, direction = "H2D");
        assert_eq!(span.name(), "copy");
    }

    #[test]
    fn test_perf_span_stays_entered_until_dropped() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = perf_span!("copy", bytes = 1024);
            let current = tracing::Span::current();
            assert_eq!(current.metadata().map(|meta| meta.name()), Some("perf"));

            drop(span);
            assert!(tracing::Span::current().is_none());
        });
    }

    #[test]
    fn test_timed_block_macro() {
        let (result, duration_us) = timed_block!("sleep", {
            thread::sleep(Duration::from_millis(5));
            7
        });
        assert_eq!(result, 7);
        assert!(duration_us >= 5_000);
    }

    #[test]
    fn test_timed_block_propagates_errors() {
        let (result, _) = timed_block!("fails", { Result::<i32, &str>::Err("boom") });
        assert!(result.is_err());
    }
}
