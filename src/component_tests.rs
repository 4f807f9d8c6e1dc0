#[cfg(test)]
mod tests {
    use crate::document::{CompiledOutput, SourceDocument};
    use crate::pipeline::{compile, CompileOptions};
    use crate::scope::DataContext;
    use crate::validate::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn render(docs: Vec<SourceDocument>, data: Value) -> CompiledOutput {
        let options = CompileOptions {
            entry: Some("index.ncl".into()),
            ..CompileOptions::default()
        };
        compile(&docs, &DataContext::from_value(data).unwrap(), options).unwrap()
    }

    fn body(output: &CompiledOutput) -> &str {
        let start = output.html.find("<body>\n").map(|i| i + 7).unwrap_or(0);
        let rest = &output.html[start..];
        let end = rest
            .find("\n<script")
            .or_else(|| rest.find("\n</body>"))
            .unwrap_or(rest.len());
        &rest[..end]
    }

    fn button() -> SourceDocument {
        SourceDocument::new(
            "components/Button.ncl",
            "<n:props>variant: String = \"primary\"</n:props><button class=\"btn btn-{{ variant }}\">{{ variant }}</button>",
        )
    }

    #[test]
    fn test_default_prop_value() {
        let output = render(vec![button(), SourceDocument::new("index.ncl", "<Button/>")], json!({}));
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(body(&output), "<button class=\"btn btn-primary\">primary</button>");
    }

    #[test]
    fn test_static_prop_and_forwarded_class() {
        let output = render(
            vec![
                button(),
                SourceDocument::new("index.ncl", "<Button variant=\"ghost\" class=\"wide\" id=\"go\"/>"),
            ],
            json!({}),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(
            body(&output),
            "<button class=\"btn btn-ghost wide\" id=\"go\">ghost</button>"
        );
    }

    #[test]
    fn test_missing_required_prop_renders_error_block() {
        let output = render(
            vec![
                SourceDocument::new("components/Card.ncl", "<n:props>title: String</n:props><h2>{{ title }}</h2>"),
                SourceDocument::new("index.ncl", "<Card/><p>after</p>"),
            ],
            json!({}),
        );
        let missing: Vec<_> = output
            .diagnostics
            .iter()
            .filter(|d| d.kind == ErrorKind::MissingRequiredProp)
            .collect();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].message.contains("`title`"));

        let html = body(&output);
        assert!(html.contains("data-ncl-error=\"NCL002\""));
        assert!(!html.contains("<h2>"));
        assert!(html.ends_with("<p>after</p>"));
        assert!(output.css.contains(".ncl-error"));
    }

    #[test]
    fn test_invalid_static_prop_falls_back_to_default() {
        let output = render(
            vec![
                SourceDocument::new("components/Counter.ncl", "<n:props>start: i32 = 1</n:props><output>{{ start }}</output>"),
                SourceDocument::new("index.ncl", "<Counter start=\"many\"/>"),
            ],
            json!({}),
        );
        assert_eq!(output.diagnostics.len(), 1);
        assert_eq!(output.diagnostics[0].kind, ErrorKind::InvalidPropType);
        assert!(!output.has_errors());
        assert_eq!(body(&output), "<output>1</output>");
    }

    #[test]
    fn test_default_slot_uses_caller_scope() {
        let output = render(
            vec![
                SourceDocument::new("components/Card.ncl", "<div class=\"card\"><slot/></div>"),
                SourceDocument::new(
                    "index.ncl",
                    "<for item=\"u\" in=\"users\"><Card>{{ u.name }}</Card></for>",
                ),
            ],
            json!({ "users": [{ "name": "Alex" }, { "name": "Sam" }] }),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(
            body(&output),
            "<div class=\"card\">Alex</div><div class=\"card\">Sam</div>"
        );
    }

    #[test]
    fn test_props_do_not_leak_into_slot_content() {
        let output = render(
            vec![
                SourceDocument::new("components/Tag.ncl", "<n:props>label: String = \"inner\"</n:props><em>{{ label }}|<slot/></em>"),
                SourceDocument::new("index.ncl", "<Tag>{{ label }}</Tag>"),
            ],
            json!({ "label": "outer" }),
        );
        assert_eq!(body(&output), "<em>inner|outer</em>");
    }

    #[test]
    fn test_named_slots_and_fallbacks() {
        let output = render(
            vec![
                SourceDocument::new(
                    "components/Panel.ncl",
                    "<section><header><slot name=\"header\">Default header</slot></header><slot/><footer><slot name=\"footer\">Default footer</slot></footer></section>",
                ),
                SourceDocument::new(
                    "index.ncl",
                    "<Panel><Panel.Header><h1>Title</h1></Panel.Header><p>Body</p></Panel>",
                ),
            ],
            json!({}),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(
            body(&output),
            "<section><header><h1>Title</h1></header><p>Body</p><footer>Default footer</footer></section>"
        );
    }

    #[test]
    fn test_slot_attribute_and_unknown_slot() {
        let output = render(
            vec![
                SourceDocument::new("components/Panel.ncl", "<section><slot name=\"footer\"/><slot/></section>"),
                SourceDocument::new(
                    "index.ncl",
                    "<Panel><small slot=\"footer\">fine print</small><i slot=\"aside\">lost</i>main</Panel>",
                ),
            ],
            json!({}),
        );
        assert_eq!(body(&output), "<section><small>fine print</small>main</section>");
        assert_eq!(output.diagnostics.len(), 1);
        assert_eq!(output.diagnostics[0].kind, ErrorKind::SlotNotFound);
    }

    #[test]
    fn test_slot_content_is_not_shared_between_usages() {
        let output = render(
            vec![
                SourceDocument::new("components/Box.ncl", "<div><slot/></div>"),
                SourceDocument::new("index.ncl", "<Box>one</Box><Box>two</Box><Box/>"),
            ],
            json!({}),
        );
        assert_eq!(body(&output), "<div>one</div><div>two</div><div></div>");
    }

    #[test]
    fn test_deferred_prop_from_loop_variable() {
        let output = render(
            vec![
                SourceDocument::new("components/Badge.ncl", "<n:props>count: i32</n:props><b>{{ count }}</b>"),
                SourceDocument::new("index.ncl", "{% for n in nums %}<Badge count={n}/>{% endfor %}"),
            ],
            json!({ "nums": [1, "2", 3] }),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(body(&output), "<b>1</b><b>2</b><b>3</b>");
    }

    #[test]
    fn test_circular_components_are_reported() {
        let output = render(
            vec![
                SourceDocument::new("components/Ping.ncl", "<p><Pong/></p>"),
                SourceDocument::new("components/Pong.ncl", "<q><Ping/></q>"),
                SourceDocument::new("index.ncl", "<Ping/>"),
            ],
            json!({}),
        );
        let cycle = output
            .diagnostics
            .iter()
            .find(|d| d.kind == ErrorKind::CircularComponentDependency)
            .unwrap();
        assert!(cycle.message.contains("Ping -> Pong -> Ping"));
        assert!(body(&output).starts_with("<p><q><div class=\"ncl-error\" data-ncl-error=\"NCL004\""));
    }

    #[test]
    fn test_unknown_component() {
        let output = render(vec![SourceDocument::new("index.ncl", "<Nope/>")], json!({}));
        assert_eq!(output.diagnostics[0].kind, ErrorKind::UnknownComponent);
        assert!(body(&output).contains("<strong>UnknownComponentError</strong>: Unknown component &lt;Nope&gt;."));
    }

    #[test]
    fn test_inline_component_and_scoped_style() {
        let output = render(
            vec![SourceDocument::new(
                "index.ncl",
                "<n:component name=\"Pill\"><span class=\"pill\"><slot/></span><style scoped>.pill { color: red; }</style></n:component><Pill>new</Pill>",
            )],
            json!({}),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        let html = body(&output);
        assert!(html.starts_with("<span class=\"pill\" data-ncl-"));
        assert!(html.ends_with(">new</span>"));
        assert!(output.css.contains(".pill[data-ncl-"));
    }
}
