//! Profiler configuration.
//!
//! Defaults suit most programs. `from_env()` lets a deployment flip them
//! without code changes:
//!
//! - `CALLGAUGE_QUALIFIED_NAMES=1`: key classes by their full module path.
//! - `CALLGAUGE_CPU_TIME=1`: record thread CPU time next to wall time
//!   (needs the `cpu-time` feature; ignored otherwise).
//! - `CALLGAUGE_CALLER_DEPTH=<n>`: extra frames to skip when identifying the
//!   caller, for wrappers around `Profiler::enter_caller`.

/// How class names are normalized before they key the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassNameStyle {
    /// Last path segment only: `parser::Lexer` becomes `Lexer`.
    #[default]
    Simple,
    /// The full path as given.
    Qualified,
}

impl ClassNameStyle {
    /// Apply the style to a `::`-separated class path.
    pub fn normalize<'a>(&self, class: &'a str) -> &'a str {
        match self {
            ClassNameStyle::Qualified => class,
            ClassNameStyle::Simple => crate::caller::last_segment(class),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    pub class_names: ClassNameStyle,
    /// Prefer a wall + thread CPU source when the platform supports it.
    pub cpu_time: bool,
    /// Frames to skip above the first frame outside the profiler when
    /// identifying a caller. Depends on how many wrapper functions sit
    /// between the instrumented method and `enter_caller`, and on what the
    /// optimizer inlined; 0 is right when the method calls it directly.
    pub caller_depth: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            class_names: ClassNameStyle::Simple,
            cpu_time: cfg!(feature = "cpu-time"),
            caller_depth: 0,
        }
    }
}

impl ProfilerConfig {
    /// Defaults overridden by `CALLGAUGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup("CALLGAUGE_QUALIFIED_NAMES") {
            if parse_flag(&v) {
                config.class_names = ClassNameStyle::Qualified;
            }
        }
        if let Some(v) = lookup("CALLGAUGE_CPU_TIME") {
            config.cpu_time = parse_flag(&v);
        }
        if let Some(v) = lookup("CALLGAUGE_CALLER_DEPTH") {
            match v.trim().parse() {
                Ok(depth) => config.caller_depth = depth,
                Err(_) => log::warn!("ignoring CALLGAUGE_CALLER_DEPTH={v:?}: not a frame count"),
            }
        }
        config
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
