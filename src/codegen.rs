//! Hydration Script Generation
//!
//! Turns the runtime modules of a page into one JavaScript program: a shared
//! runtime (state map, update routine, idempotent listener attachment and
//! strategy scheduling) followed by one `nclRegister` call per island. Each
//! registration and the assembled program are syntax-checked with oxc before
//! they are emitted.

use crate::island::{DerivedExpr, MutationOp, RuntimeModule};
use crate::validate::{Diagnostic, ErrorKind, HydrationStrategy, Stage};
use oxc_allocator::Allocator;
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde_json::{json, Map, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME
// ═══════════════════════════════════════════════════════════════════════════════

const RUNTIME_PRELUDE: &str = r#"(function () {
  "use strict";
  var R = {
    num: function (v) { return typeof v === "number" && isFinite(v); },
    truthy: function (v) {
      if (v === null || v === undefined || v === false || v === 0 || v === "") return false;
      if (Array.isArray(v)) return v.length > 0;
      if (typeof v === "object") return Object.keys(v).length > 0;
      return true;
    },
    text: function (v) {
      if (v === null || v === undefined) return "";
      if (typeof v === "object") return JSON.stringify(v);
      return String(v);
    },
    neg: function (v) { return R.num(v) ? -v : null; },
    op: function (name, l, r) {
      var n = R.num(l) && R.num(r);
      switch (name) {
        case "add": return n ? l + r : R.text(l) + R.text(r);
        case "sub": return n ? l - r : null;
        case "mul": return n ? l * r : null;
        case "div": return n && r !== 0 ? l / r : null;
        case "rem": return n && r !== 0 ? l % r : null;
        case "eq": return n ? l === r : JSON.stringify(l) === JSON.stringify(r);
        case "ne": return !R.op("eq", l, r);
        case "lt": case "le": case "gt": case "ge":
          if (!n && !(typeof l === "string" && typeof r === "string")) return false;
          if (name === "lt") return l < r;
          if (name === "le") return l <= r;
          if (name === "gt") return l > r;
          return l >= r;
        case "and": return R.truthy(l) && R.truthy(r);
        case "or": return R.truthy(l) || R.truthy(r);
      }
      return null;
    }
  };

  function nclUpdate(island) {
    island.derived.forEach(function (d) {
      island.values[d.name] = d.compute(island.values[d.dependency]);
    });
    var nodes = island.root.querySelectorAll("[data-ncl-bind]");
    for (var i = 0; i < nodes.length; i++) {
      var name = nodes[i].getAttribute("data-ncl-bind");
      if (Object.prototype.hasOwnProperty.call(island.values, name)) {
        nodes[i].textContent = R.text(island.values[name]);
      }
    }
  }

  function nclApply(island, action) {
    var current = island.values[action.target];
    var next = action.operand;
    if (action.op === "increment") next = R.op("add", current, action.operand);
    if (action.op === "decrement") next = R.op("sub", current, action.operand);
    island.values[action.target] = next;
    nclUpdate(island);
  }

  function nclAttach(island) {
    var root = island.root;
    if (root.__nclAttached) return;
    root.__nclAttached = true;
    var elements = root.querySelectorAll("[data-ncl-action]");
    for (var i = 0; i < elements.length; i++) {
      var el = elements[i];
      if (el.__nclBound) continue;
      el.__nclBound = true;
      el.getAttribute("data-ncl-action").split(" ").forEach(function (id) {
        var action = island.actions[id];
        if (!action) return;
        el.addEventListener(action.event, function () { nclApply(island, action); });
      });
    }
    nclUpdate(island);
  }

  function nclSchedule(island) {
    var attach = function () { nclAttach(island); };
    if (island.strategy === "visible" && "IntersectionObserver" in window) {
      var observer = new IntersectionObserver(function (entries) {
        for (var i = 0; i < entries.length; i++) {
          if (entries[i].isIntersecting) {
            observer.disconnect();
            attach();
            return;
          }
        }
      });
      observer.observe(island.root);
    } else if (island.strategy === "idle") {
      if ("requestIdleCallback" in window) window.requestIdleCallback(attach);
      else setTimeout(attach, 1);
    } else if (island.strategy === "media" && island.media) {
      var query = window.matchMedia(island.media);
      if (query.matches) {
        attach();
      } else {
        var onChange = function (event) {
          if (!event.matches) return;
          if (query.removeEventListener) query.removeEventListener("change", onChange);
          attach();
        };
        if (query.addEventListener) query.addEventListener("change", onChange);
        else query.addListener(onChange);
      }
    } else {
      attach();
    }
  }

  function nclRegister(def) {
    var root = document.querySelector('[data-ncl-island="' + def.id + '"]');
    if (!root) return;
    var island = {
      root: root,
      strategy: def.strategy,
      media: def.media,
      values: {},
      derived: def.derived,
      actions: def.actions
    };
    for (var name in def.state) island.values[name] = def.state[name];
    nclSchedule(island);
  }
"#;

const RUNTIME_EPILOGUE: &str = "})();\n";

/// JavaScript for a derived expression; `v` is the dependency value.
pub fn derived_to_js(expr: &DerivedExpr) -> String {
    match expr {
        DerivedExpr::Param => "v".to_string(),
        DerivedExpr::Literal { value } => value.to_string(),
        DerivedExpr::Neg { expr } => format!("R.neg({})", derived_to_js(expr)),
        DerivedExpr::Not { expr } => format!("!R.truthy({})", derived_to_js(expr)),
        DerivedExpr::Binary { op, left, right } => format!(
            "R.op(\"{}\", {}, {})",
            op.name(),
            derived_to_js(left),
            derived_to_js(right)
        ),
    }
}

/// One `nclRegister(...)` statement.
pub fn generate_registration(module: &RuntimeModule) -> String {
    let state: Map<String, Value> = module
        .state
        .iter()
        .map(|s| (s.name.clone(), s.initial.clone()))
        .collect();
    let actions: Map<String, Value> = module
        .actions
        .iter()
        .map(|a| {
            let op = match a.mutation.op {
                MutationOp::Assign => "assign",
                MutationOp::Increment => "increment",
                MutationOp::Decrement => "decrement",
            };
            (
                a.id.clone(),
                json!({
                    "event": a.event,
                    "target": a.mutation.target,
                    "op": op,
                    "operand": a.mutation.operand,
                }),
            )
        })
        .collect();
    let media = match &module.strategy {
        HydrationStrategy::Media(query) => Value::String(query.clone()),
        _ => Value::Null,
    };

    let derived = module
        .derived
        .iter()
        .map(|d| {
            format!(
                "{{ name: {}, dependency: {}, compute: function (v) {{ return {}; }} }}",
                Value::String(d.name.clone()),
                Value::String(d.dependency.clone()),
                derived_to_js(&d.expr)
            )
        })
        .collect::<Vec<_>>()
        .join(",\n      ");

    format!(
        "  nclRegister({{\n    id: {},\n    strategy: {},\n    media: {},\n    state: {},\n    derived: [{}],\n    actions: {}\n  }});\n",
        Value::String(module.id.clone()),
        Value::String(module.strategy.as_str().to_string()),
        media,
        Value::Object(state),
        derived,
        Value::Object(actions)
    )
}

/// Parse `code` as an ES module and report the first syntax error.
pub fn verify_script(code: &str) -> Result<(), String> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_module(true);
    let ret = Parser::new(&allocator, code, source_type).parse();
    match ret.errors.first() {
        None => Ok(()),
        Some(error) => Err(error.to_string()),
    }
}

/// Result of generating the page's hydration script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationScript {
    pub code: String,
    /// Modules whose registration made it into `code`.
    pub modules: Vec<RuntimeModule>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Empty when there are no islands. A module whose registration fails the
/// syntax check is left out and its island stays static.
pub fn generate_hydration_script(modules: Vec<RuntimeModule>, file: &str) -> HydrationScript {
    let mut script = HydrationScript::default();
    if modules.is_empty() {
        return script;
    }

    let mut registrations = String::new();
    for module in modules {
        let registration = generate_registration(&module);
        match verify_script(&registration) {
            Ok(()) => {
                registrations.push_str(&registration);
                script.modules.push(module);
            }
            Err(reason) => script.diagnostics.push(
                Diagnostic::error(
                    Stage::Islands,
                    ErrorKind::IslandParse,
                    format!("Generated runtime for island {} is invalid: {}", module.id, reason),
                )
                .in_file(file),
            ),
        }
    }
    if script.modules.is_empty() {
        return script;
    }

    let code = format!("{}\n{}{}", RUNTIME_PRELUDE, registrations, RUNTIME_EPILOGUE);
    if let Err(reason) = verify_script(&code) {
        script.diagnostics.push(
            Diagnostic::error(
                Stage::Islands,
                ErrorKind::IslandParse,
                format!("Generated hydration runtime is invalid: {}", reason),
            )
            .in_file(file),
        );
        script.modules.clear();
        return script;
    }
    tracing::debug!(file = %file, islands = script.modules.len(), bytes = code.len(), "hydration script generated");
    script.code = code;
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::island::{parse_derived_expr, ActionBinding, DerivedEntry, Mutation, StateEntry};
    use serde_json::json;

    fn counter_module() -> RuntimeModule {
        let expr = parse_derived_expr("*c * 2", "c").unwrap();
        RuntimeModule {
            id: "i0".into(),
            strategy: HydrationStrategy::Media("(min-width: 600px)".into()),
            state: vec![StateEntry {
                name: "count".into(),
                initial: json!(0),
            }],
            derived: vec![DerivedEntry {
                name: "double".into(),
                dependency: "count".into(),
                param: "c".into(),
                expr,
                initial: json!(0),
            }],
            actions: vec![ActionBinding {
                id: "i0a0".into(),
                event: "click".into(),
                mutation: Mutation {
                    target: "count".into(),
                    op: MutationOp::Increment,
                    operand: json!(1),
                },
            }],
        }
    }

    #[test]
    fn test_runtime_prelude_is_valid_javascript() {
        let code = format!("{}{}", RUNTIME_PRELUDE, RUNTIME_EPILOGUE);
        assert_eq!(verify_script(&code), Ok(()));
    }

    #[test]
    fn test_derived_to_js() {
        let expr = parse_derived_expr("!(*p + 1 > 2)", "p").unwrap();
        assert_eq!(
            derived_to_js(&expr),
            "!R.truthy(R.op(\"gt\", R.op(\"add\", v, 1), 2))"
        );
    }

    #[test]
    fn test_generate_hydration_script() {
        let script = generate_hydration_script(vec![counter_module()], "page.ncl");
        assert!(script.diagnostics.is_empty(), "{:?}", script.diagnostics);
        assert_eq!(script.modules.len(), 1);
        assert!(script.code.contains("nclRegister({\n    id: \"i0\""));
        assert!(script.code.contains("media: \"(min-width: 600px)\""));
        assert!(script.code.contains("\"op\":\"increment\""));
        assert!(script.code.contains("root.__nclAttached"));
    }

    #[test]
    fn test_no_islands_no_script() {
        let script = generate_hydration_script(Vec::new(), "page.ncl");
        assert!(script.code.is_empty());
        assert!(script.modules.is_empty());
    }

    #[test]
    fn test_verify_script_reports_errors() {
        assert!(verify_script("nclRegister({ id: ").is_err());
    }
}
