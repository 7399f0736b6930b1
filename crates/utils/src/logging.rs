//! `VERBOSE` option mapping onto tracing filter directives.
//!
//! The `VERBOSE` setting selects which modules log at debug level:
//!
//! - empty, `"0"`, or `"false"`: warnings only
//! - `"1"`, `"true"`, or `"all"`: debug for every prism crate
//! - a comma list of `module` or `module.method` entries: debug for the
//!   named modules (method granularity collapses to its module; tracing
//!   filters by target, not by function)
//!
//! Known short module names map onto their crate targets; anything else is
//! passed through as a raw directive so full targets keep working.

const BASE: &str = "warn";

const ALL_MODULES: &[&str] = &[
    "prism_core",
    "prism_utils",
    "prism_client",
    "prism_relay",
];

/// (short name, tracing target) for every loggable module.
const MODULE_TARGETS: &[(&str, &str)] = &[
    ("session", "prism_client::session"),
    ("pool", "prism_client::pool"),
    ("broadcast", "prism_client::broadcast"),
    ("ranker", "prism_client::ranker"),
    ("mirror", "prism_client::mirror"),
    ("probe", "prism_client::probe"),
    ("store", "prism_relay::store"),
    ("server", "prism_relay::server"),
    ("policy", "prism_relay::policy"),
    ("classify", "prism_relay::classify"),
];

/// Build an `EnvFilter` directive string from a `VERBOSE` value.
pub fn verbose_filter(verbose: &str) -> String {
    let verbose = verbose.trim();
    if verbose.is_empty() || verbose == "0" || verbose == "false" {
        return BASE.to_string();
    }
    if verbose == "1" || verbose == "true" || verbose == "all" {
        let mut out = String::from(BASE);
        for module in ALL_MODULES {
            out.push_str(&format!(",{module}=debug"));
        }
        return out;
    }

    let mut out = String::from(BASE);
    for entry in verbose.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        // "module.method" narrows to its module
        let module = entry.split('.').next().unwrap_or(entry);
        let target = MODULE_TARGETS
            .iter()
            .find(|(short, _)| *short == module)
            .map(|(_, target)| *target)
            .unwrap_or(module);
        out.push_str(&format!(",{target}=debug"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_disables_debug() {
        assert_eq!(verbose_filter(""), "warn");
        assert_eq!(verbose_filter("false"), "warn");
        assert_eq!(verbose_filter("0"), "warn");
    }

    #[test]
    fn all_enables_every_crate() {
        let filter = verbose_filter("1");
        assert!(filter.contains("prism_client=debug"));
        assert!(filter.contains("prism_relay=debug"));
        assert_eq!(filter, verbose_filter("all"));
    }

    #[test]
    fn module_list_maps_to_targets() {
        let filter = verbose_filter("broadcast,mirror");
        assert!(filter.contains("prism_client::broadcast=debug"));
        assert!(filter.contains("prism_client::mirror=debug"));
        assert!(!filter.contains("prism_relay"));
    }

    #[test]
    fn method_granularity_collapses_to_module() {
        let filter = verbose_filter("store.query_events");
        assert!(filter.contains("prism_relay::store=debug"));
    }

    #[test]
    fn unknown_names_pass_through() {
        let filter = verbose_filter("hyper");
        assert!(filter.contains("hyper=debug"));
    }
}
