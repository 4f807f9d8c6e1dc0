#[cfg(test)]
mod tests {
    use crate::finalize::render_nodes;
    use crate::interpolate::resolve_interpolations;
    use crate::parse::parse_template;
    use crate::pipeline::CompileMode;
    use crate::scope::DataContext;
    use crate::transform::expand_control_flow;
    use crate::validate::{Diagnostic, ErrorKind, Severity};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn expand(src: &str, data: Value) -> (String, Vec<Diagnostic>) {
        let parsed = parse_template(src, "t.ncl");
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        let data = DataContext::from_value(data).unwrap();
        let (nodes, mut diagnostics) =
            expand_control_flow(parsed.nodes, &data, CompileMode::Lenient, "t.ncl");
        let (nodes, more) = resolve_interpolations(nodes, &data, CompileMode::Lenient, "t.ncl");
        diagnostics.extend(more);
        (render_nodes(&nodes), diagnostics)
    }

    fn render_clean(src: &str, data: Value) -> String {
        let (html, diagnostics) = expand(src, data);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        html
    }

    #[test]
    fn test_loop_metadata() {
        let html = render_clean(
            "{% for x in xs %}{{ loop.index }}:{{ x }}{% if not loop.last %},{% endif %}{% endfor %}",
            json!({ "xs": ["a", "b", "c"] }),
        );
        assert_eq!(html, "1:a,2:b,3:c");
    }

    #[test]
    fn test_object_iteration_yields_key_value_pairs() {
        let html = render_clean(
            "{% for e in prices %}{{ e.key }}={{ e.value }};{% endfor %}",
            json!({ "prices": { "a": 1, "b": 2.5 } }),
        );
        assert_eq!(html, "a=1;b=2.5;");
    }

    #[test]
    fn test_loop_variable_shadows_and_does_not_leak() {
        let html = render_clean(
            "{% for x in xs %}{{ x }}{% endfor %}|{{ x }}",
            json!({ "xs": ["a", "b"], "x": "outer" }),
        );
        assert_eq!(html, "ab|outer");
    }

    #[test]
    fn test_nested_loops_see_outer_bindings() {
        let html = render_clean(
            "<for item=\"g\" in=\"groups\"><for item=\"m\" in=\"g.members\">{{ g.name }}/{{ m }} </for></for>",
            json!({ "groups": [{ "name": "x", "members": [1, 2] }, { "name": "y", "members": [3] }] }),
        );
        assert_eq!(html, "x/1 x/2 y/3 ");
    }

    #[test]
    fn test_values_are_escaped() {
        let html = render_clean(
            "<p title=\"{{ t }}\">{{ t }}</p>",
            json!({ "t": "<b>\"x\"</b>" }),
        );
        assert_eq!(
            html,
            "<p title=\"&lt;b&gt;&quot;x&quot;&lt;/b&gt;\">&lt;b&gt;&quot;x&quot;&lt;/b&gt;</p>"
        );
    }

    #[test]
    fn test_missing_field_and_null_render_empty() {
        let html = render_clean(
            "[{{ user.nick }}][{{ user.bio }}][{{ price }}][{{ ok }}]",
            json!({ "user": { "bio": null }, "price": 2.0, "ok": true }),
        );
        assert_eq!(html, "[][][2][true]");
    }

    #[test]
    fn test_boolean_attribute_expressions() {
        let html = render_clean(
            "<input disabled={off} checked={on} name={field}>",
            json!({ "off": false, "on": true, "field": "q" }),
        );
        assert_eq!(html, "<input checked name=\"q\">");
    }

    #[test]
    fn test_non_scalar_interpolation_is_an_error() {
        let (html, diagnostics) = expand("<p>{{ tags }}</p>", json!({ "tags": ["a"] }));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, ErrorKind::NonScalarInterpolation);
        assert!(diagnostics[0].message.contains("an array"));
        assert!(html.contains("ncl-error"));
    }

    #[test]
    fn test_unresolved_collections_by_dialect() {
        assert_eq!(render_clean("<for item=\"x\" in=\"nope\">x</for>", json!({})), "");

        let (_, diagnostics) = expand("{% for x in nope %}x{% endfor %}", json!({}));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, ErrorKind::ControlFlowSyntax);
        assert_eq!(diagnostics[0].severity, Severity::Error);
    }

    #[test]
    fn test_conditions() {
        let data = json!({ "count": 3, "role": "admin", "items": [] });
        assert_eq!(
            render_clean("{% if ghost %}A{% else %}B{% endif %}", data.clone()),
            "B"
        );
        assert_eq!(
            render_clean(
                "{% if count > 5 %}big{% elif role == 'admin' && not items %}admin{% else %}none{% endif %}",
                data.clone(),
            ),
            "admin"
        );
        assert_eq!(
            render_clean("<if condition=\"items.is_empty()\">empty</if>", data),
            "empty"
        );
    }

    #[test]
    fn test_unresolved_interpolation_passes_through_in_lenient_mode() {
        let (html, diagnostics) = expand("<p>{{ ghost }}</p>", json!({}));
        assert_eq!(html, "<p>{{ ghost }}</p>");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, ErrorKind::InterpolationTargetMissing);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
    }
}
