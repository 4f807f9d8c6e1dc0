#[cfg(test)]
mod tests {
    use crate::document::{CompiledOutput, SourceDocument};
    use crate::island::HydratedIsland;
    use crate::pipeline::{compile, CompileOptions};
    use crate::scope::DataContext;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn compile_page(docs: Vec<SourceDocument>, data: Value) -> CompiledOutput {
        let options = CompileOptions {
            entry: Some("index.ncl".into()),
            ..CompileOptions::default()
        };
        compile(&docs, &DataContext::from_value(data).unwrap(), options).unwrap()
    }

    fn page(markup: &str, data: Value) -> CompiledOutput {
        compile_page(vec![SourceDocument::new("index.ncl", markup)], data)
    }

    fn site() -> Vec<SourceDocument> {
        vec![
            SourceDocument::new(
                "layouts/Base.ncl",
                "<nav>site</nav><main><slot/></main><style>nav { margin: 0; }</style>",
            ),
            SourceDocument::new(
                "components/Card.ncl",
                "<n:props>title: String\nfeatured: bool = false</n:props><article><h2>{{ title }}</h2><if condition=\"featured\"><b>*</b></if><slot/></article><style scoped>h2 { font-weight: 600; }</style>",
            ),
            SourceDocument::new(
                "index.ncl",
                "<n:layout name=\"Base\"/><for item=\"p\" in=\"posts\"><Card title={p.title} featured={p.featured}>{{ p.summary }}</Card></for>{% if posts.is_empty() %}<p>none</p>{% else %}<p>{{ posts.len() }} posts</p>{% endif %}",
            ),
        ]
    }

    fn site_data() -> Value {
        json!({
            "posts": [
                { "title": "One", "featured": true, "summary": "first" },
                { "title": "Two", "featured": false, "summary": "second" }
            ]
        })
    }

    #[test]
    fn test_loop_renders_each_item_in_order() {
        let output = page(
            "<ul><for item=\"u\" in=\"users\"><li>{{ u.name }}</li></for></ul>",
            json!({ "users": [{ "name": "Alex" }, { "name": "Sam" }] }),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert!(output.html.contains("<ul><li>Alex</li><li>Sam</li></ul>"));
    }

    #[test]
    fn test_exactly_one_branch_is_kept() {
        let markup = "<if condition=\"a\">A</if><elif condition=\"b\">B</elif><else>C</else>";
        let cases = [
            (json!({ "a": true, "b": true }), "A"),
            (json!({ "a": false, "b": true }), "B"),
            (json!({ "a": 0, "b": "" }), "C"),
            (json!({}), "C"),
        ];
        for (data, expected) in cases {
            let output = page(&format!("<p>{}</p>", markup), data);
            assert!(output.html.contains(&format!("<p>{}</p>", expected)), "{}", output.html);
        }
    }

    #[test]
    fn test_slot_content_sees_caller_variables() {
        let output = compile_page(
            vec![
                SourceDocument::new("components/Card.ncl", "<div class=\"card\"><slot/></div>"),
                SourceDocument::new("index.ncl", "<Card>{{ outerVar }}</Card>"),
            ],
            json!({ "outerVar": "from page" }),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert!(output.html.contains("<div class=\"card\">from page</div>"));
    }

    #[test]
    fn test_missing_prop_does_not_abort_the_pass() {
        let output = compile_page(
            vec![
                SourceDocument::new("components/Card.ncl", "<n:props>title: String</n:props><h2>{{ title }}</h2>"),
                SourceDocument::new("index.ncl", "<Card/><Card title=\"ok\"/>"),
            ],
            json!({}),
        );
        assert!(output.has_errors());
        assert!(output.html.contains("data-ncl-error=\"NCL002\""));
        assert!(output.html.contains("<h2>ok</h2>"));
    }

    #[test]
    fn test_full_site_leaves_no_directives_behind() {
        let output = compile_page(site(), site_data());
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        for leftover in ["<slot", "<for", "<if", "<Card", "<n:", "{%", "{{"] {
            assert!(!output.html.contains(leftover), "found {} in {}", leftover, output.html);
        }
        assert!(output.html.contains("<nav>site</nav><main>"));
        assert_eq!(output.html.matches("<article").count(), 2);
        assert_eq!(output.html.matches("<html").count(), 1);
        assert!(output.html.contains("<p>2 posts</p>"));
        assert_eq!(output.html.matches(">*</b>").count(), 1);
        assert!(output.css.starts_with("nav { margin: 0; }"));
        assert!(output.css.contains("h2[data-ncl-"));
    }

    #[test]
    fn test_output_is_deterministic() {
        let first = compile_page(site(), site_data());
        let second = compile_page(site(), site_data());
        assert_eq!(first, second);

        let mut reordered = site();
        reordered.reverse();
        let third = compile_page(reordered, site_data());
        assert_eq!(first.html, third.html);
        assert_eq!(first.css, third.css);
    }

    #[test]
    fn test_island_hydration_sequence() {
        let output = page(
            "<n:island client:load><script>let count = Signal(0)\nlet label = computed(count, |c| \"n=\" + c)</script><button onclick=\"count.update(|p| *p += 1)\">{count}</button><i>{label}</i></n:island>",
            json!({}),
        );
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert!(output.html.contains("data-ncl-island=\"i0\""));
        assert!(output.html.contains("<span data-ncl-bind=\"count\">0</span>"));
        assert!(output.html.contains("<span data-ncl-bind=\"label\">n=0</span>"));
        assert!(output.script.contains("nclRegister("));

        let mut island = HydratedIsland::new(output.islands[0].clone());
        let action = island.module().actions[0].id.clone();
        assert_eq!(island.attach(), 1);
        assert_eq!(island.attach(), 0);

        let mut seen = vec![island.render_bindings()["count"].clone()];
        for _ in 0..2 {
            assert!(island.dispatch(&action));
            seen.push(island.render_bindings()["count"].clone());
        }
        assert_eq!(seen, vec!["0", "1", "2"]);
        assert_eq!(island.render_bindings()["label"], "n=2");
    }

    #[test]
    fn test_each_hydration_strategy_reaches_the_runtime() {
        let cases = [
            ("client:load", "load", "null"),
            ("client:visible", "visible", "null"),
            ("client:idle", "idle", "null"),
            ("client:media=\"(min-width: 40em)\"", "media", "\"(min-width: 40em)\""),
        ];
        for (directive, strategy, media) in cases {
            let output = page(
                &format!(
                    "<n:island {}><script>let n = Signal(1)</script><b>{{n}}</b></n:island>",
                    directive
                ),
                json!({}),
            );
            assert!(output.diagnostics.is_empty(), "{}: {:?}", directive, output.diagnostics);
            assert_eq!(output.islands.len(), 1);
            assert!(
                output.html.contains(&format!("data-ncl-hydrate=\"{}\"", strategy)),
                "{}",
                output.html
            );
            assert!(output.script.contains("function nclSchedule(island)"));
            assert!(
                output.script.contains(&format!("strategy: \"{}\",\n    media: {},", strategy, media)),
                "{}",
                output.script
            );
            assert!(crate::codegen::verify_script(&output.script).is_ok());
        }

        let media = page(
            "<n:island client:media=\"(min-width: 40em)\"><script>let n = Signal(1)</script><b>{n}</b></n:island>",
            json!({}),
        );
        assert!(media.html.contains("data-ncl-media=\"(min-width: 40em)\""));
    }

    #[test]
    fn test_page_without_islands_ships_no_runtime() {
        let output = page("<p>static</p>", json!({}));
        assert!(output.script.is_empty());
        assert!(output.islands.is_empty());
        assert!(!output.html.contains("<script"));
    }
}
