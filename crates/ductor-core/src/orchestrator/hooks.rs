//! Message hooks: conditionally-appended prompt suffixes evaluated per call.

use tracing::{debug, info};

/// Immutable snapshot of session state passed to hook conditions.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub chat_id: i64,
    pub message_count: u64,
    pub is_new_session: bool,
    pub provider: String,
    pub model: String,
}

type HookCondition = Box<dyn Fn(&HookContext) -> bool + Send + Sync>;

/// A named hook that appends text to the prompt when its condition is met.
pub struct MessageHook {
    pub name: &'static str,
    condition: HookCondition,
    suffix: String,
}

impl MessageHook {
    pub fn new(
        name: &'static str,
        condition: impl Fn(&HookContext) -> bool + Send + Sync + 'static,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            name,
            condition: Box::new(condition),
            suffix: suffix.into(),
        }
    }
}

/// Registry of message hooks, applied before each CLI call.
#[derive(Default)]
pub struct MessageHookRegistry {
    hooks: Vec<MessageHook>,
}

impl MessageHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: MessageHook) {
        debug!(name = hook.name, "Hook registered");
        self.hooks.push(hook);
    }

    /// Evaluate all hooks and append matching suffixes to the prompt.
    pub fn apply(&self, prompt: &str, ctx: &HookContext) -> String {
        let suffixes: Vec<&str> = self
            .hooks
            .iter()
            .filter(|hook| {
                let fired = (hook.condition)(ctx);
                if fired {
                    info!(name = hook.name, msgs = ctx.message_count, "Hook fired");
                }
                fired
            })
            .map(|hook| hook.suffix.as_str())
            .collect();
        if suffixes.is_empty() {
            return prompt.to_string();
        }
        format!("{}\n\n{}", prompt, suffixes.join("\n\n"))
    }
}

/// Fire on every n-th message (6th, 12th, ...). Never on the first.
///
/// `message_count` is pre-increment: count 5 means the 6th message is about
/// to be sent.
pub fn every_n_messages(n: u64) -> impl Fn(&HookContext) -> bool {
    move |ctx| {
        let effective = ctx.message_count + 1;
        effective >= n && effective % n == 0
    }
}

const MAINMEMORY_REMINDER_SUFFIX: &str = "## MEMORY CHECK\n\
Silently review: memory_system/MAINMEMORY.md, user_tools/, cron_tasks/.\n\
Compare what you already know with this conversation so far.\n\
If something important is missing from memory (personality, preferences, \
decisions, facts) -- update MAINMEMORY.md silently.\n\
If you notice a gap that only the user can fill, ask ONE natural follow-up \
question that fits the current conversation. Do not interrogate.";

/// Built-in reminder that fires every 6th message.
pub fn mainmemory_reminder() -> MessageHook {
    MessageHook::new(
        "mainmemory_reminder",
        every_n_messages(6),
        MAINMEMORY_REMINDER_SUFFIX,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(message_count: u64) -> HookContext {
        HookContext {
            chat_id: 1,
            message_count,
            is_new_session: false,
            provider: "claude".into(),
            model: "opus".into(),
        }
    }

    #[test]
    fn test_every_n_fires_on_multiples() {
        let mut registry = MessageHookRegistry::new();
        registry.register(mainmemory_reminder());

        // message N (1-indexed) fires iff N >= 6 and N % 6 == 0;
        // message_count is pre-increment, so N = count + 1.
        for count in 0..30u64 {
            let n = count + 1;
            let expected = n >= 6 && n % 6 == 0;
            let applied = registry.apply("msg", &ctx(count));
            assert_eq!(
                applied.contains("MEMORY CHECK"),
                expected,
                "message {n} (count {count})"
            );
        }
    }

    #[test]
    fn test_no_hooks_returns_prompt_unchanged() {
        let registry = MessageHookRegistry::new();
        assert_eq!(registry.apply("hello", &ctx(5)), "hello");
    }

    #[test]
    fn test_multiple_suffixes_joined() {
        let mut registry = MessageHookRegistry::new();
        registry.register(MessageHook::new("a", |_| true, "SUFFIX_A"));
        registry.register(MessageHook::new("b", |_| true, "SUFFIX_B"));
        let applied = registry.apply("prompt", &ctx(0));
        assert_eq!(applied, "prompt\n\nSUFFIX_A\n\nSUFFIX_B");
    }
}
