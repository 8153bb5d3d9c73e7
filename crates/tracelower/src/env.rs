use std::env;
use std::sync::OnceLock;

static TRACELOWER_DUMP_GRAPHS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn dump_graphs_enabled() -> bool {
    *TRACELOWER_DUMP_GRAPHS.get_or_init(|| match env::var("TRACELOWER_DUMP_GRAPHS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
