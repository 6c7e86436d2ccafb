//! Expression evaluation over a [`Document`].

use crate::error::Result;
use crate::xml::{Document, NodeId};

use super::functions;
use super::parser::{self, Axis, BinOp, Expr, PathExpr, PathStart, Predicate, Step};
use super::{xpath_err, FunctionProvider, Item, Value};

/// The evaluation context threaded through an expression.
pub(crate) struct Ctx<'c> {
    /// Context items for relative steps.
    pub items: &'c [Item],
    /// 1-based position within a predicate, 1 otherwise.
    pub position: usize,
    /// Context size within a predicate, 1 otherwise.
    pub size: usize,
    /// The node `evaluate` was called with; `current()` returns it even
    /// inside predicates.
    pub current: &'c [Item],
}

/// The XPath evaluator: one document, an optional engine function provider.
pub struct XPathEval<'a> {
    doc: &'a Document,
    provider: Option<&'a dyn FunctionProvider>,
}

impl<'a> XPathEval<'a> {
    pub fn new(doc: &'a Document) -> Self {
        Self {
            doc,
            provider: None,
        }
    }

    pub fn with_provider(doc: &'a Document, provider: &'a dyn FunctionProvider) -> Self {
        Self {
            doc,
            provider: Some(provider),
        }
    }

    pub fn doc(&self) -> &Document {
        self.doc
    }

    /// Parse and evaluate an expression against a context node.
    pub fn evaluate(&self, expr: &str, context: NodeId) -> Result<Value> {
        let ast = parser::parse(expr)?;
        let current = [Item::Node(context)];
        let ctx = Ctx {
            items: &current,
            position: 1,
            size: 1,
            current: &current,
        };
        self.eval_expr(&ast, &ctx)
            .map_err(|e| xpath_err(expr, e.message))
    }

    pub(crate) fn eval_expr(&self, expr: &Expr, ctx: &Ctx<'_>) -> Result<Value> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right, ctx),
            Expr::Path(path) => self.eval_path(path, ctx),
        }
    }

    // -- operators ----------------------------------------------------------

    fn eval_binary(&self, op: BinOp, left: &Expr, right: &Expr, ctx: &Ctx<'_>) -> Result<Value> {
        let lhs = self.eval_expr(left, ctx)?;

        // Lazy logical operators.
        match op {
            BinOp::Or if lhs.truthy() => return Ok(Value::Bool(true)),
            BinOp::And if !lhs.truthy() => return Ok(Value::Bool(false)),
            _ => {}
        }

        let rhs = self.eval_expr(right, ctx)?;

        match op {
            BinOp::Or => Ok(Value::Bool(rhs.truthy())),
            BinOp::And => Ok(Value::Bool(rhs.truthy())),
            BinOp::Pipe => {
                let (Value::Seq(mut l), Value::Seq(r)) = (lhs, rhs) else {
                    return Err(xpath_err("|", "union requires sequences on both sides"));
                };
                l.extend(r);
                Ok(Value::Seq(l))
            }
            BinOp::Eq | BinOp::Neq => {
                let equal = self.values_equal(&lhs, &rhs);
                Ok(Value::Bool(if op == BinOp::Eq { equal } else { !equal }))
            }
            BinOp::Lt | BinOp::Leq | BinOp::Gt | BinOp::Geq => {
                let l = self.numeric_operand(&lhs, op)?;
                let r = self.numeric_operand(&rhs, op)?;
                let b = match op {
                    BinOp::Lt => l < r,
                    BinOp::Leq => l <= r,
                    BinOp::Gt => l > r,
                    BinOp::Geq => l >= r,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(b))
            }
            BinOp::Plus | BinOp::Minus | BinOp::Mult | BinOp::Mod => {
                // Integer arithmetic stays integral.
                if let (Value::Int(l), Value::Int(r)) = (&lhs, &rhs) {
                    return Ok(match op {
                        BinOp::Plus => Value::Int(l + r),
                        BinOp::Minus => Value::Int(l - r),
                        BinOp::Mult => Value::Int(l * r),
                        BinOp::Mod => {
                            if *r == 0 {
                                return Err(xpath_err("mod", "modulo by zero"));
                            }
                            Value::Int(l % r)
                        }
                        _ => unreachable!(),
                    });
                }
                let l = self.numeric_operand(&lhs, op)?;
                let r = self.numeric_operand(&rhs, op)?;
                Ok(Value::Float(match op {
                    BinOp::Plus => l + r,
                    BinOp::Minus => l - r,
                    BinOp::Mult => l * r,
                    BinOp::Mod => l % r,
                    _ => unreachable!(),
                }))
            }
            BinOp::Div => {
                let l = self.numeric_operand(&lhs, op)?;
                let r = self.numeric_operand(&rhs, op)?;
                if r == 0.0 {
                    return Err(xpath_err("div", "division by zero"));
                }
                Ok(Value::Float(l / r))
            }
        }
    }

    /// Equality: numeric when both sides read as numbers, string otherwise.
    fn values_equal(&self, lhs: &Value, rhs: &Value) -> bool {
        if let (Some(l), Some(r)) = (lhs.as_number(self.doc), rhs.as_number(self.doc)) {
            return l == r;
        }
        lhs.as_string(self.doc) == rhs.as_string(self.doc)
    }

    fn numeric_operand(&self, value: &Value, op: BinOp) -> Result<f64> {
        value.as_number(self.doc).ok_or_else(|| {
            xpath_err(
                "operator",
                format!(
                    "non-numeric operand {:?} for {op:?}",
                    value.as_string(self.doc)
                ),
            )
        })
    }

    // -- paths ---------------------------------------------------------------

    fn eval_path(&self, path: &PathExpr, ctx: &Ctx<'_>) -> Result<Value> {
        let mut from_document = false;

        let mut items: Vec<Item> = match &path.start {
            PathStart::Root => {
                from_document = true;
                Vec::new()
            }
            PathStart::Context => ctx.items.to_vec(),
            PathStart::Call { name, args } => {
                let value = self.call_function(name, args, ctx)?;
                if path.steps.is_empty() {
                    return Ok(value);
                }
                match value {
                    Value::Seq(items) => items,
                    other => {
                        return Err(xpath_err(
                            name,
                            format!(
                                "cannot apply a path step to {:?}",
                                other.as_string(self.doc)
                            ),
                        ));
                    }
                }
            }
            PathStart::Paren(inner) => {
                let value = self.eval_expr(inner, ctx)?;
                if path.steps.is_empty() {
                    return Ok(value);
                }
                match value {
                    Value::Seq(items) => items,
                    other => {
                        return Err(xpath_err(
                            "()",
                            format!(
                                "cannot apply a path step to {:?}",
                                other.as_string(self.doc)
                            ),
                        ));
                    }
                }
            }
        };

        for (i, step) in path.steps.iter().enumerate() {
            let mut next = Vec::new();
            if from_document && i == 0 {
                self.apply_step(None, step, &mut next)?;
            } else {
                for item in &items {
                    self.apply_step(Some(item), step, &mut next)?;
                }
            }
            items = self.apply_predicates(next, &step.predicates, ctx)?;
        }

        Ok(Value::Seq(items))
    }

    /// One step from one source. `None` is the document itself (absolute
    /// paths), whose single child element is the root.
    fn apply_step(&self, source: Option<&Item>, step: &Step, out: &mut Vec<Item>) -> Result<()> {
        match step.axis {
            Axis::SelfNode => match source {
                None => out.push(Item::Node(self.doc.root())),
                Some(item) => out.push(item.clone()),
            },
            Axis::Parent => {
                if let Some(item) = source {
                    match item {
                        Item::Node(id) => {
                            if let Some(parent) = self.doc.parent(*id) {
                                out.push(Item::Node(parent));
                            }
                        }
                        Item::Attr { node, .. } => out.push(Item::Node(*node)),
                    }
                }
            }
            Axis::Child => {
                let candidates = self.child_candidates(source, step.depth);
                for id in candidates {
                    if step.name == "*" || self.doc.name(id) == Some(step.name.as_str()) {
                        out.push(Item::Node(id));
                    }
                }
            }
            Axis::Attribute => {
                let owners: Vec<NodeId> = match source {
                    None => {
                        if step.depth {
                            self.doc.descendant_elements(self.doc.root())
                        } else {
                            Vec::new()
                        }
                    }
                    Some(Item::Node(id)) => {
                        if step.depth {
                            self.doc.descendant_elements(*id)
                        } else {
                            vec![*id]
                        }
                    }
                    Some(Item::Attr { .. }) => Vec::new(),
                };
                for owner in owners {
                    for (name, _) in self.doc.attrs(owner) {
                        if step.name == "*" || *name == step.name {
                            out.push(Item::Attr {
                                node: owner,
                                name: name.clone(),
                            });
                        }
                    }
                }
            }
            Axis::PrecedingSibling | Axis::FollowingSibling => {
                let Some(Item::Node(id)) = source else {
                    return Ok(());
                };
                let Some(parent) = self.doc.parent(*id) else {
                    return Ok(());
                };
                let siblings = self.doc.child_elements(parent);
                let pos = siblings.iter().position(|&s| s == *id);
                let Some(pos) = pos else { return Ok(()) };

                let selected: Vec<NodeId> = if step.axis == Axis::PrecedingSibling {
                    // Nearest sibling first, matching reverse walk order.
                    siblings[..pos].iter().rev().copied().collect()
                } else {
                    siblings[pos + 1..].to_vec()
                };
                for sib in selected {
                    if step.name == "*" || self.doc.name(sib) == Some(step.name.as_str()) {
                        out.push(Item::Node(sib));
                    }
                }
            }
        }
        Ok(())
    }

    /// Child elements of a source, or its full element subtree when the
    /// step was written with `//`.
    fn child_candidates(&self, source: Option<&Item>, depth: bool) -> Vec<NodeId> {
        match source {
            None => {
                if depth {
                    self.doc.descendant_elements(self.doc.root())
                } else {
                    vec![self.doc.root()]
                }
            }
            Some(Item::Node(id)) => {
                if depth {
                    let mut all = Vec::new();
                    for child in self.doc.child_elements(*id) {
                        all.extend(self.doc.descendant_elements(child));
                    }
                    all
                } else {
                    self.doc.child_elements(*id)
                }
            }
            Some(Item::Attr { .. }) => Vec::new(),
        }
    }

    fn apply_predicates(
        &self,
        items: Vec<Item>,
        predicates: &[Predicate],
        ctx: &Ctx<'_>,
    ) -> Result<Vec<Item>> {
        let mut items = items;
        for predicate in predicates {
            match predicate {
                Predicate::Index(n) => {
                    // XPath indexes are 1-based; out of range selects nothing.
                    if *n >= 1 && (*n as usize) <= items.len() {
                        items = vec![items[*n as usize - 1].clone()];
                    } else {
                        items.clear();
                    }
                }
                Predicate::Filter(filter) => {
                    let size = items.len();
                    let mut kept = Vec::new();
                    for (idx, item) in items.into_iter().enumerate() {
                        let slot = [item];
                        let inner = Ctx {
                            items: &slot,
                            position: idx + 1,
                            size,
                            current: ctx.current,
                        };
                        if self.eval_expr(filter, &inner)?.truthy() {
                            let [item] = slot;
                            kept.push(item);
                        }
                    }
                    items = kept;
                }
            }
        }
        Ok(items)
    }

    // -- functions -----------------------------------------------------------

    pub(crate) fn call_function(
        &self,
        name: &str,
        args: &[Expr],
        ctx: &Ctx<'_>,
    ) -> Result<Value> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_expr(arg, ctx)?);
        }

        // Engine-registered functions take precedence.
        if let Some(provider) = self.provider {
            if let Some(result) = provider.call(name, &values, self.doc) {
                return result;
            }
        }

        match functions::call_builtin(self, name, &values, ctx) {
            Some(result) => result,
            None => Err(xpath_err(name, format!("unknown function: {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::Document;

    fn doc() -> Document {
        Document::parse(
            r#"<workflow><subjobs><job name="first"><tasks><task path="/bin/a" queue="q1"/><task path="/bin/b" queue="q2"/></tasks></job><job name="second"><tasks><task path="/bin/c"/></tasks></job></subjobs></workflow>"#,
        )
        .unwrap()
    }

    fn eval(d: &Document, expr: &str) -> Value {
        XPathEval::new(d)
            .evaluate(expr, d.root())
            .unwrap_or_else(|e| panic!("eval failed for {expr:?}: {e}"))
    }

    #[test]
    fn arithmetic_and_precedence() {
        let d = doc();
        assert_eq!(eval(&d, "1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval(&d, "10 mod 3"), Value::Int(1));
        assert_eq!(eval(&d, "7 div 2"), Value::Float(3.5));
    }

    #[test]
    fn division_by_zero_errors() {
        let d = doc();
        assert!(XPathEval::new(&d).evaluate("1 div 0", d.root()).is_err());
    }

    #[test]
    fn relative_path_counts_nodes() {
        let d = doc();
        let Value::Seq(items) = eval(&d, "subjobs/job") else {
            panic!("expected seq");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn absolute_path_resolves_from_document() {
        let d = doc();
        let job = d.first_child_named(d.root(), "subjobs").unwrap();
        let job = d.children_named(job, "job")[0];
        // Absolute path ignores the context node.
        let v = XPathEval::new(&d)
            .evaluate("/workflow/subjobs/job", job)
            .unwrap();
        let Value::Seq(items) = v else { panic!("expected seq") };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn depth_search_finds_all_tasks() {
        let d = doc();
        let Value::Seq(items) = eval(&d, "//task") else {
            panic!("expected seq");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn attribute_step() {
        let d = doc();
        let v = eval(&d, "subjobs/job[1]/@name");
        assert_eq!(v.as_string(&d), "first");
    }

    #[test]
    fn index_predicate_is_one_based() {
        let d = doc();
        let v = eval(&d, "//task[2]/@path");
        assert_eq!(v.as_string(&d), "/bin/b");

        let Value::Seq(items) = eval(&d, "//task[9]") else {
            panic!("expected seq");
        };
        assert!(items.is_empty());
    }

    #[test]
    fn filter_predicate_with_attribute() {
        let d = doc();
        let v = eval(&d, "//task[@queue = 'q2']/@path");
        assert_eq!(v.as_string(&d), "/bin/b");
    }

    #[test]
    fn filter_predicate_with_position() {
        let d = doc();
        let v = eval(&d, "//task[position() = last()]/@path");
        assert_eq!(v.as_string(&d), "/bin/c");
    }

    #[test]
    fn comparisons_are_numeric_when_possible() {
        let d = doc();
        assert_eq!(eval(&d, "'10' = 10"), Value::Bool(true));
        assert_eq!(eval(&d, "'2' < '10'"), Value::Bool(true));
        assert_eq!(eval(&d, "'a' = 'a'"), Value::Bool(true));
        assert_eq!(eval(&d, "'a' != 'b'"), Value::Bool(true));
    }

    #[test]
    fn lazy_logic() {
        let d = doc();
        // The right side would error (unknown function) if evaluated.
        assert_eq!(eval(&d, "true() or nosuchfn()"), Value::Bool(true));
        assert_eq!(eval(&d, "false() and nosuchfn()"), Value::Bool(false));
    }

    #[test]
    fn union_concatenates() {
        let d = doc();
        let Value::Seq(items) = eval(&d, "//job[1]/tasks/task | //job[2]/tasks/task") else {
            panic!("expected seq");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn parent_and_self_steps() {
        let d = doc();
        let v = eval(&d, "subjobs/job[1]/tasks/../@name");
        assert_eq!(v.as_string(&d), "first");
    }

    #[test]
    fn sibling_axes() {
        let d = doc();
        let v = eval(&d, "//job[2]/preceding-sibling::job/@name");
        assert_eq!(v.as_string(&d), "first");
        let v = eval(&d, "//job[1]/following-sibling::job/@name");
        assert_eq!(v.as_string(&d), "second");
    }

    #[test]
    fn provider_functions_take_precedence() {
        struct Fake;
        impl FunctionProvider for Fake {
            fn call(&self, name: &str, _args: &[Value], _doc: &Document) -> Option<Result<Value>> {
                (name == "evqGetParameter").then(|| Ok(Value::Str("bound".into())))
            }
        }
        let d = doc();
        let provider = Fake;
        let eval = XPathEval::with_provider(&d, &provider);
        let v = eval.evaluate("evqGetParameter('x')", d.root()).unwrap();
        assert_eq!(v, Value::Str("bound".into()));
    }

    #[test]
    fn unknown_function_errors() {
        let d = doc();
        assert!(XPathEval::new(&d).evaluate("bogus()", d.root()).is_err());
    }
}
