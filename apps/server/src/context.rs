//! Per-operation request context.
//!
//! Every operation gets one [`OperationContext`] carrying its identity, the
//! negotiated languages, the wall-clock budget, the ValueSet recursion stack
//! used for circular-reference detection, and handles to the shared caches.
//! Recursive expansion of imported ValueSets reuses the same context, so the
//! budget and the cycle guard span the whole operation.

use crate::caches::{ExpansionCache, ResourceCache};
use crate::error::{Error, Result};
use argentum_languages::Languages;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tracks elapsed time against a budget and keeps an annotation trail.
#[derive(Debug)]
pub struct TimeTracker {
    start: Instant,
    budget: Option<Duration>,
    trail: Mutex<Vec<(u128, String)>>,
}

impl TimeTracker {
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            budget,
            trail: Mutex::new(Vec::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn log(&self, note: impl Into<String>) {
        let mut trail = self.trail.lock().expect("time tracker poisoned");
        trail.push((self.start.elapsed().as_millis(), note.into()));
    }

    /// Render the trail as `elapsed-ms: note` lines.
    pub fn render(&self) -> String {
        let trail = self.trail.lock().expect("time tracker poisoned");
        trail
            .iter()
            .map(|(ms, note)| format!("{:6}ms  {}", ms, note))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn exceeded(&self) -> bool {
        self.budget.is_some_and(|budget| self.start.elapsed() > budget)
    }
}

/// Per-request operation state.
pub struct OperationContext {
    pub request_id: String,
    /// Accept-Language preference list
    pub languages: Languages,
    /// Explicit displayLanguage override, when the client sent one
    pub display_languages: Option<Languages>,
    time: TimeTracker,
    valueset_stack: Mutex<Vec<String>>,
    pub resource_cache: Arc<ResourceCache>,
    pub expansion_cache: Arc<ExpansionCache>,
}

impl OperationContext {
    pub fn new(
        request_id: impl Into<String>,
        languages: Languages,
        budget: Option<Duration>,
        resource_cache: Arc<ResourceCache>,
        expansion_cache: Arc<ExpansionCache>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            languages,
            display_languages: None,
            time: TimeTracker::new(budget),
            valueset_stack: Mutex::new(Vec::new()),
            resource_cache,
            expansion_cache,
        }
    }

    /// The language list display selection should use: the displayLanguage
    /// override when present, the Accept-Language list otherwise.
    pub fn display_languages(&self) -> &Languages {
        self.display_languages.as_ref().unwrap_or(&self.languages)
    }

    /// Check the time budget. `location` lands in the trail so too-costly
    /// diagnostics say where the budget ran out.
    pub fn dead_check(&self, location: &str) -> Result<()> {
        if self.time.exceeded() {
            self.time.log(format!("budget exceeded at {}", location));
            return Err(Error::TooCostly {
                message: format!(
                    "Operation exceeded its time budget after {}ms (at {})",
                    self.time.elapsed().as_millis(),
                    location
                ),
                diagnostics: Some(self.time.render()),
            });
        }
        Ok(())
    }

    pub fn log(&self, note: impl Into<String>) {
        let note = note.into();
        tracing::debug!(request_id = %self.request_id, "{}", note);
        self.time.log(note);
    }

    pub fn elapsed(&self) -> Duration {
        self.time.elapsed()
    }

    pub fn trail(&self) -> String {
        self.time.render()
    }

    /// Register entry into a ValueSet. Fails when the URL is already on the
    /// stack, reporting the full cycle.
    pub fn enter_valueset(&self, url: &str) -> Result<()> {
        let mut stack = self.valueset_stack.lock().expect("valueset stack poisoned");
        if stack.iter().any(|entered| entered == url) {
            let cycle = stack
                .iter()
                .cloned()
                .chain(std::iter::once(url.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::CircularReference(format!("[{}]", cycle)));
        }
        stack.push(url.to_string());
        Ok(())
    }

    pub fn leave_valueset(&self, url: &str) {
        let mut stack = self.valueset_stack.lock().expect("valueset stack poisoned");
        if stack.last().map(String::as_str) == Some(url) {
            stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(budget: Option<Duration>) -> OperationContext {
        OperationContext::new(
            "test-req",
            Languages::default(),
            budget,
            Arc::new(ResourceCache::new()),
            Arc::new(ExpansionCache::new(16, Duration::from_millis(0), 16)),
        )
    }

    #[test]
    fn dead_check_passes_within_budget() {
        let ctx = context(Some(Duration::from_secs(30)));
        assert!(ctx.dead_check("test").is_ok());
    }

    #[test]
    fn dead_check_fails_once_budget_is_spent() {
        let ctx = context(Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        let err = ctx.dead_check("expansion loop").unwrap_err();
        match err {
            Error::TooCostly { message, diagnostics } => {
                assert!(message.contains("expansion loop"));
                assert!(diagnostics.unwrap().contains("budget exceeded"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn disabled_budget_never_fires_but_cycles_still_detected() {
        let ctx = context(None);
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctx.dead_check("anywhere").is_ok());

        ctx.enter_valueset("http://example.org/vs/a").unwrap();
        ctx.enter_valueset("http://example.org/vs/b").unwrap();
        let err = ctx.enter_valueset("http://example.org/vs/a").unwrap_err();
        assert!(matches!(err, Error::CircularReference(_)));
    }

    #[test]
    fn cycle_error_lists_the_full_stack() {
        let ctx = context(None);
        ctx.enter_valueset("http://example.org/vs/a").unwrap();
        ctx.enter_valueset("http://example.org/vs/b").unwrap();
        let err = ctx.enter_valueset("http://example.org/vs/a").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("http://example.org/vs/a, http://example.org/vs/b, http://example.org/vs/a"));
    }

    #[test]
    fn leave_unwinds_for_sibling_imports() {
        let ctx = context(None);
        ctx.enter_valueset("http://example.org/vs/a").unwrap();
        ctx.leave_valueset("http://example.org/vs/a");
        assert!(ctx.enter_valueset("http://example.org/vs/a").is_ok());
    }

    #[test]
    fn trail_keeps_elapsed_annotations() {
        let ctx = context(None);
        ctx.log("resolved ValueSet");
        ctx.log("expanded 42 concepts");
        let trail = ctx.trail();
        assert!(trail.contains("resolved ValueSet"));
        assert!(trail.contains("expanded 42 concepts"));
    }
}
