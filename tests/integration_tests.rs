//! End-to-end tests driving the evaluator over raw source.

use std::sync::Arc;

use typeval::{
    evaluate_source, Content, ContentNode, Element, EvalErrorKind, MemoryWorld, Value,
};

fn eval(source: &str) -> Content {
    evaluate_source(Arc::new(MemoryWorld::new()), "main.typ", source)
        .unwrap_or_else(|e| panic!("evaluation failed: {e}\nsource: {source}"))
}

fn eval_err(source: &str) -> typeval::EvalError {
    match evaluate_source(Arc::new(MemoryWorld::new()), "main.typ", source) {
        Ok(content) => panic!("expected an error, got: {content:?}"),
        Err(e) => e,
    }
}

fn text(source: &str) -> String {
    eval(source)
        .iter()
        .map(|n| n.plain_text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn elements(content: &Content) -> Vec<&Element> {
    content
        .iter()
        .filter_map(|n| match n {
            ContentNode::Elem(elem) => Some(elem),
            ContentNode::Text(_) => None,
        })
        .collect()
}

fn find_elem<'a>(content: &'a Content, name: &str) -> Option<&'a Element> {
    for node in content {
        if let ContentNode::Elem(elem) = node {
            if elem.name == name {
                return Some(elem);
            }
            for value in elem.fields.values() {
                if let Value::Content(inner) = value {
                    if let Some(found) = find_elem(inner, name) {
                        return Some(found);
                    }
                }
            }
        }
    }
    None
}

// ============================================================================
// Expressions and bindings
// ============================================================================

#[test]
fn let_binding_and_arithmetic() {
    assert_eq!(text("#let x = 2\n#(x + 3)"), "5");
}

#[test]
fn block_joins_through_addition() {
    assert_eq!(text("#{1; 2}"), "3");
    assert_eq!(text("#{\"a\"; \"b\"}"), "ab");
}

#[test]
fn division_widens_to_float() {
    assert_eq!(text("#(10 / 4)"), "2.5");
}

#[test]
fn shadowing_is_block_scoped() {
    assert_eq!(text("#let x = 1\n#{let x = 2; x}-#x"), "2-1");
}

#[test]
fn conditionals_require_booleans() {
    assert_eq!(text("#if 2 > 1 [yes] else [no]"), "yes");
    let err = eval_err("#if 1 [yes]");
    assert!(matches!(err.kind, EvalErrorKind::TypeMismatch { .. }));
}

#[test]
fn logic_short_circuits() {
    // The non-boolean second operand is never reached.
    assert_eq!(text("#(false and \"x\" == 1)"), "false");
    assert_eq!(text("#(true or \"x\" == 1)"), "true");
}

#[test]
fn containment_operator() {
    assert_eq!(text("#(\"ell\" in \"hello\")"), "true");
    assert_eq!(text("#(2 in (1, 2, 3))"), "true");
    assert_eq!(text("#(\"a\" in (a: 1))"), "true");
    assert_eq!(text("#(4 not in (1, 2, 3))"), "true");
}

#[test]
fn destructuring_with_sink() {
    assert_eq!(
        text("#let (a, ..mid, b) = (1, 2, 3, 4)\n#repr((a, mid, b))"),
        "(1, (2, 3), 4)"
    );
}

#[test]
fn dict_destructuring() {
    assert_eq!(text("#let (x, y) = (x: 1, y: 2)\n#(x + y)"), "3");
}

#[test]
fn destructuring_arity_mismatch_fails() {
    let err = eval_err("#let (a, b, c) = (1, 2)");
    assert!(matches!(err.kind, EvalErrorKind::Argument(_)));
}

#[test]
fn undefined_identifier_message() {
    let err = eval_err("#blorp");
    assert!(err.to_string().contains("blorp not defined in scope"));
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn for_loop_joins_content() {
    assert_eq!(text("#for i in (1, 2, 3) { [#i ] }"), "1 2 3");
}

#[test]
fn for_over_string_and_dict() {
    assert_eq!(text("#for c in \"abc\" [#c.]"), "a.b.c.");
    assert_eq!(text("#for (k, v) in (a: 1, b: 2) [#k#v ]"), "a1 b2");
}

#[test]
fn while_with_break() {
    let source = r#"
#let count() = {
  let i = 0
  while true {
    i = i + 1
    if i == 3 { break }
  }
  i
}
#count()
"#;
    assert_eq!(text(source), "3");
}

#[test]
fn continue_skips_iteration() {
    let source = r#"
#let odds() = {
  let out = ()
  for i in range(6) {
    if calc.rem(i, 2) == 0 { continue }
    out.push(i)
  }
  repr(out)
}
#odds()
"#;
    assert_eq!(text(source), "(1, 3, 5)");
}

#[test]
fn return_exits_function_early() {
    let source = r#"
#let first-big(xs) = {
  for x in xs {
    if x > 10 { return x }
  }
  none
}
#first-big((3, 14, 15))
"#;
    assert_eq!(text(source), "14");
}

#[test]
fn break_at_top_level_is_an_error() {
    let err = eval_err("#break");
    assert!(err.to_string().contains("top level"));
}

// ============================================================================
// Closures
// ============================================================================

#[test]
fn closures_capture_their_environment() {
    let source = r#"
#let make-adder(x) = y => x + y
#let add5 = make-adder(5)
#add5(10)
"#;
    assert_eq!(text(source), "15");
}

#[test]
fn recursion_through_the_binding_name() {
    let source = r#"
#let fact(n) = if n <= 1 { 1 } else { n * fact(n - 1) }
#fact(5)
"#;
    assert_eq!(text(source), "120");
}

#[test]
fn sink_collects_middle_arguments() {
    let source = r#"
#let f(x, ..rest, y) = repr((x, rest.pos(), y))
#f(1, 2, 3, 4)
"#;
    assert_eq!(text(source), "(1, (2, 3), 4)");
}

#[test]
fn named_defaults_can_depend_on_prior_params() {
    assert_eq!(text("#let f(x, y: x + 1) = repr((x, y))\n#f(5)"), "(5, 6)");
    assert_eq!(text("#let f(x, y: x + 1) = repr((x, y))\n#f(5, y: 0)"), "(5, 0)");
}

#[test]
fn missing_argument_is_an_error() {
    let err = eval_err("#let f(x) = x\n#f()");
    assert!(matches!(err.kind, EvalErrorKind::Argument(_)));
}

#[test]
fn unknown_named_argument_is_an_error() {
    let err = eval_err("#let f(x) = x\n#f(1, nope: 2)");
    assert!(matches!(err.kind, EvalErrorKind::Argument(_)));
}

#[test]
fn later_bindings_are_invisible_to_earlier_closures() {
    let err = eval_err("#let f() = y\n#let y = 1\n#f()");
    assert!(matches!(err.kind, EvalErrorKind::Undefined(_)));
}

#[test]
fn assignment_cannot_cross_function_boundary() {
    let err = eval_err("#let x = 1\n#let f() = { x = 2 }\n#f()");
    assert!(matches!(err.kind, EvalErrorKind::Undefined(_)));
}

#[test]
fn partial_application_with() {
    let source = r#"
#let add(a, b) = a + b
#let inc = add.with(1)
#inc(5)
"#;
    assert_eq!(text(source), "6");
}

// ============================================================================
// Lvalues and methods
// ============================================================================

#[test]
fn lvalue_roundtrip_through_nested_containers() {
    let source = r#"
#let data = (scores: (1, 2, 3))
#{ data.scores.at(0) = 9 }
#data.scores.first()
"#;
    assert_eq!(text(source), "9");
}

#[test]
fn field_assignment_inserts_into_dict() {
    assert_eq!(text("#let d = (:)\n#{ d.x = 1 }\n#d.x"), "1");
}

#[test]
fn compound_assignment() {
    assert_eq!(text("#let x = 10\n#{ x -= 3 }\n#x"), "7");
}

#[test]
fn mutators_write_back_through_lvalues() {
    assert_eq!(text("#let xs = (1, 2)\n#{ xs.push(3) }\n#xs.len()"), "3");
}

#[test]
fn negative_indices_count_from_the_end() {
    assert_eq!(text("#(1, 2, 3).at(-1)"), "3");
    assert_eq!(text("#\"abc\".at(-1)"), "c");
}

#[test]
fn array_pipeline() {
    assert_eq!(
        text("#(1, 2, 3, 4).filter(x => calc.rem(x, 2) == 0).map(x => x * x).sum()"),
        "20"
    );
    assert_eq!(text("#repr((3, 1, 2).sorted())"), "(1, 2, 3)");
    assert_eq!(text("#repr((1, 2).zip((3, 4)))"), "((1, 3), (2, 4))");
    assert_eq!(text("#repr((1, (2, (3,))).flatten())"), "(1, 2, 3)");
}

#[test]
fn string_methods() {
    assert_eq!(text("#\"a,b,c\".split(\",\").len()"), "3");
    assert_eq!(text("#\"hello\".replace(\"l\", \"L\")"), "heLLo");
    assert_eq!(text("#\"  pad  \".trim()"), "pad");
    assert_eq!(text("#\"hello\".position(regex(\"l+\"))"), "2");
}

#[test]
fn dict_methods() {
    assert_eq!(text("#repr((a: 1, b: 2).keys())"), "(\"a\", \"b\")");
    assert_eq!(text("#(a: 1).at(\"b\", default: 0)"), "0");
}

#[test]
fn first_on_empty_array_is_a_domain_error() {
    let err = eval_err("#().first()");
    assert!(matches!(err.kind, EvalErrorKind::Domain(_)));
}

#[test]
fn methods_are_callable_values() {
    // Field access without a call materializes a bound method.
    assert_eq!(text("#let f = \"hello\".len\n#f()"), "5");
}

// ============================================================================
// Markup
// ============================================================================

#[test]
fn strong_markup_element() {
    let content = eval("*hello*");
    assert_eq!(content.len(), 1);
    let ContentNode::Elem(elem) = &content[0] else { panic!("expected element") };
    assert_eq!(elem.name, "strong");
    assert_eq!(
        elem.field("body"),
        Some(&Value::Content(vec![ContentNode::Text("hello".into())]))
    );
}

#[test]
fn smart_quotes_open_and_close() {
    assert_eq!(text("He said \"hi\""), "He said \u{201C}hi\u{201D}");
    assert_eq!(text("don't"), "don\u{2019}t");
}

#[test]
fn headings_carry_their_level() {
    let content = eval("== Sub");
    let heading = find_elem(&content, "heading").expect("heading element");
    assert_eq!(heading.field("level"), Some(&Value::Int(2)));
}

#[test]
fn raw_blocks() {
    let content = eval("```rust\nfn main() {}\n```");
    let raw = find_elem(&content, "raw").expect("raw element");
    assert_eq!(raw.field("text"), Some(&Value::Str("fn main() {}".into())));
    assert_eq!(raw.field("lang"), Some(&Value::Str("rust".into())));
    assert_eq!(raw.field("block"), Some(&Value::Bool(true)));
}

#[test]
fn inline_raw_has_no_language() {
    let content = eval("`code`");
    let raw = find_elem(&content, "raw").expect("raw element");
    assert_eq!(raw.field("lang"), Some(&Value::None));
    assert_eq!(raw.field("block"), Some(&Value::Bool(false)));
}

#[test]
fn list_items_group_greedily() {
    let content = eval("- a\n- b\n\nrest");
    let list = find_elem(&content, "list").expect("list element");
    let Some(Value::Array(items)) = list.field("items") else { panic!("items") };
    assert_eq!(items.len(), 2);
    let lists = elements(&content).iter().filter(|e| e.name == "list").count();
    assert_eq!(lists, 1);
}

#[test]
fn enum_start_number() {
    let content = eval("2. a\n3. b");
    let listing = find_elem(&content, "enum").expect("enum element");
    assert_eq!(listing.field("start"), Some(&Value::Int(2)));
    let Some(Value::Array(items)) = listing.field("items") else { panic!("items") };
    assert_eq!(items.len(), 2);
}

#[test]
fn term_lists() {
    let content = eval("/ Term: Description");
    let terms = find_elem(&content, "terms").expect("terms element");
    let Some(Value::Array(items)) = terms.field("items") else { panic!("items") };
    assert_eq!(items.len(), 1);
    let Value::Array(pair) = &items[0] else { panic!("pair") };
    assert_eq!(pair.len(), 2);
}

#[test]
fn urls_become_links() {
    let content = eval("https://example.org");
    let link = find_elem(&content, "link").expect("link element");
    assert_eq!(
        link.field("target"),
        Some(&Value::Str("https://example.org".into()))
    );
}

#[test]
fn references() {
    let content = eval("@intro");
    let reference = find_elem(&content, "ref").expect("ref element");
    assert_eq!(reference.field("label"), Some(&Value::Label("intro".into())));
}

#[test]
fn labels_attach_to_the_previous_element() {
    let content = eval("#strong[x] <tag>");
    let ContentNode::Elem(elem) = &content[0] else { panic!("expected element") };
    assert_eq!(elem.label.as_deref(), Some("tag"));
}

#[test]
fn no_empty_text_nodes_and_no_adjacent_text() {
    let content = eval("#\"\"a#\"\"b#\"\"");
    for pair in content.windows(2) {
        assert!(
            !matches!(pair, [ContentNode::Text(_), ContentNode::Text(_)]),
            "adjacent text nodes in {content:?}"
        );
    }
    for node in &content {
        if let ContentNode::Text(t) = node {
            assert!(!t.is_empty(), "empty text node in {content:?}");
        }
    }
    assert_eq!(text("#\"\"a#\"\"b#\"\""), "ab");
}

// ============================================================================
// Set and show
// ============================================================================

#[test]
fn set_rule_styles_text() {
    let content = eval("#set text(fill: \"red\")\nhi");
    let styled = find_elem(&content, "text").expect("text element");
    assert_eq!(styled.field("fill"), Some(&Value::Str("red".into())));
    assert_eq!(styled.field("text"), Some(&Value::Str("\nhi".into())));
}

#[test]
fn set_is_confined_to_its_block() {
    let content = eval("#[#set text(fill: \"red\")\nin] out");
    assert!(find_elem(&content, "text").is_some());
    // The trailing text is unstyled plain text.
    assert!(matches!(content.last(), Some(ContentNode::Text(_))));
}

#[test]
fn call_arguments_override_set_defaults() {
    let content = eval("#set raw(lang: \"c\")\n#raw(\"x\", lang: \"py\")");
    let raw = find_elem(&content, "raw").expect("raw element");
    assert_eq!(raw.field("lang"), Some(&Value::Str("py".into())));
}

#[test]
fn show_string_rule_rewrites_text() {
    assert_eq!(text("#show \"cat\": it => [dog]\ncat"), "dog");
}

#[test]
fn show_regex_rule() {
    assert_eq!(text("#show regex(\"c.t\"): it => [dog]\ncot"), "dog");
}

#[test]
fn show_element_rule() {
    let source = "#show heading: it => [replaced]\n= Title";
    assert_eq!(text(source), "replaced");
}

#[test]
fn show_where_constrains_fields() {
    let source = "#show heading.where(level: 1): it => [H1]\n= A\n== B";
    let content = eval(source);
    let headings: Vec<_> = elements(&content)
        .into_iter()
        .filter(|e| e.name == "heading")
        .collect();
    assert_eq!(headings.len(), 1);
    assert_eq!(headings[0].field("level"), Some(&Value::Int(2)));
    assert!(text(source).contains("H1"));
}

#[test]
fn show_everything_wraps_the_rest() {
    let content = eval("#show: it => strong(it)\nhello");
    assert_eq!(content.len(), 1);
    let ContentNode::Elem(elem) = &content[0] else { panic!("expected element") };
    assert_eq!(elem.name, "strong");
}

#[test]
fn show_replacement_content() {
    // A non-function body replaces each match outright.
    assert_eq!(text("#show \"a\": [b]\na"), "b");
}

#[test]
fn show_set_passes_through() {
    let content = eval("#show heading: set text(size: 12pt)\n= T");
    assert!(find_elem(&content, "heading").is_some());
}

#[test]
fn show_rules_are_scoped_to_their_block() {
    let source = "#[#show \"a\": [b]\na] a";
    assert_eq!(text(source), "b a");
}

#[test]
fn newer_rules_apply_first() {
    // "b" matches only the newer rule; the older rule does not run again on
    // its output.
    let source = "#show \"a\": [b]\n#show \"b\": [c]\nb";
    assert_eq!(text(source), "c");
}

// ============================================================================
// Math
// ============================================================================

#[test]
fn equations_wrap_their_body() {
    let content = eval("$x$");
    let equation = find_elem(&content, "equation").expect("equation element");
    assert_eq!(equation.field("block"), Some(&Value::Bool(false)));
    assert_eq!(equation.field("numbering"), Some(&Value::None));
}

#[test]
fn attachments_in_math() {
    let content = eval("$x^2$");
    assert!(find_elem(&content, "attach").is_some());
}

#[test]
fn fractions_strip_one_paren_group() {
    let content = eval("$(a+b)/2$");
    let frac = find_elem(&content, "frac").expect("frac element");
    let Some(Value::Content(num)) = frac.field("num") else { panic!("num") };
    let flat: String = num.iter().map(|n| n.plain_text()).collect();
    assert_eq!(flat, "a+b");
}

#[test]
fn delimited_groups_become_lr() {
    let content = eval("$[x]$");
    let lr = find_elem(&content, "math.lr").expect("math.lr element");
    let Some(Value::Content(body)) = lr.field("body") else { panic!("body") };
    let flat: String = body.iter().map(|n| n.plain_text()).collect();
    assert_eq!(flat, "[x]");
}

#[test]
fn symbol_variants_in_math() {
    assert!(text("$x arrow.l y$").contains('\u{2190}'));
    assert!(text("$arrow.double$").contains('\u{21D2}'));
}

#[test]
fn accent_symbols_call_the_accent_element() {
    let content = eval("$hat(x)$");
    assert!(find_elem(&content, "accent").is_some());
}

#[test]
fn unknown_math_callee_renders_literally() {
    assert_eq!(text("$lim(x)$"), "lim(x)");
}

#[test]
fn symbols_outside_math_through_the_module() {
    assert_eq!(text("#sym.arrow"), "\u{2192}");
}

// ============================================================================
// Modules and eval
// ============================================================================

fn library_world() -> Arc<MemoryWorld> {
    Arc::new(MemoryWorld::new().with_file(
        "lib.typ",
        "#let double(x) = x * 2\n#let brand = \"ACME\"",
    ))
}

#[test]
fn import_selected_items() {
    let out = evaluate_source(
        library_world(),
        "main.typ",
        "#import \"lib.typ\": double, brand\n#double(4) #brand",
    )
    .unwrap();
    let flat: String = out.iter().map(|n| n.plain_text()).collect();
    assert_eq!(flat.trim(), "8 ACME");
}

#[test]
fn import_binds_the_module_name() {
    let out = evaluate_source(
        library_world(),
        "main.typ",
        "#import \"lib.typ\"\n#lib.double(21)",
    )
    .unwrap();
    let flat: String = out.iter().map(|n| n.plain_text()).collect();
    assert_eq!(flat.trim(), "42");
}

#[test]
fn include_merges_exports() {
    let out = evaluate_source(
        library_world(),
        "main.typ",
        "#include \"lib.typ\"\n#double(2)",
    )
    .unwrap();
    let flat: String = out.iter().map(|n| n.plain_text()).collect();
    assert_eq!(flat.trim(), "4");
}

#[test]
fn missing_import_item_fails() {
    let result = evaluate_source(
        library_world(),
        "main.typ",
        "#import \"lib.typ\": nonexistent",
    );
    assert!(result.is_err());
}

#[test]
fn modules_resolve_relative_to_the_importer() {
    let world = Arc::new(
        MemoryWorld::new()
            .with_file("sub/inner.typ", "#let marker = \"inner\"")
            .with_file(
                "sub/outer.typ",
                "#import \"inner.typ\": marker\n#let reexport = marker",
            ),
    );
    let out = evaluate_source(
        world,
        "main.typ",
        "#import \"sub/outer.typ\": reexport\n#reexport",
    )
    .unwrap();
    let flat: String = out.iter().map(|n| n.plain_text()).collect();
    assert_eq!(flat.trim(), "inner");
}

#[test]
fn eval_builtin_computes() {
    assert_eq!(text("#eval(\"2 * 21\")"), "42");
}

#[test]
fn eval_cannot_import_files() {
    let world = Arc::new(MemoryWorld::new().with_file("lib.typ", "#let x = 1"));
    let result = evaluate_source(
        world,
        "main.typ",
        "#eval(\"{ import \\\"lib.typ\\\": x; x }\")",
    );
    let err = result.unwrap_err();
    assert!(err.to_string().contains("eval: "), "got: {err}");
}

// ============================================================================
// Counters and values
// ============================================================================

#[test]
fn counters_step_and_display() {
    let source = r#"
#let c = counter("fig")
#{ c.step(); c.step() }
#c.display()
"#;
    assert_eq!(text(source), "2");
}

#[test]
fn counter_update_with_function() {
    let source = r#"
#let c = counter("n")
#{ c.update(10); c.update(n => n * 2) }
#c.display()
"#;
    assert_eq!(text(source), "20");
}

#[test]
fn counter_at_is_unimplemented() {
    let err = eval_err("#counter(\"x\").at(1)");
    assert!(err.to_string().contains("unimplemented"));
}

#[test]
fn colors_adjust_componentwise() {
    assert_eq!(text("#luma(50%).negate()"), "luma(50%)");
    assert_eq!(text("#rgb(100, 0, 0).lighten(100%)"), "rgb(255, 255, 255)");
}

#[test]
fn alignments_merge_on_addition() {
    assert_eq!(text("#repr(left + top)"), "left + top");
}

#[test]
fn type_names() {
    assert_eq!(text("#type(1.5)"), "float");
    assert_eq!(text("#type((:))"), "dictionary");
    assert_eq!(text("#type(50%)"), "ratio");
}

#[test]
fn units_evaluate_to_typed_values() {
    assert_eq!(text("#type(12pt)"), "length");
    assert_eq!(text("#type(45deg)"), "angle");
    assert_eq!(text("#type(1fr)"), "fraction");
    assert_eq!(text("#(2fr)"), "2fr");
}

#[test]
fn exponentiation_semantics() {
    assert_eq!(text("#calc.pow(2, 10)"), "1024");
    assert_eq!(text("#type(calc.pow(2, 10))"), "int");
    assert_eq!(text("#type(calc.pow(2.0, 2))"), "float");
}
