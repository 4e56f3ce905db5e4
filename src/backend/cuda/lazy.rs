//! Fused code generation: one kernel source for a whole sub-DAG. The
//! traversal assigns every node a variable `v0, v1, ...` and prepends the
//! line computing it from its children, so the finished body reads top-down.
//! Store, constant and already-materialized nodes become kernel parameters
//! accessed as `Pk[index % n]`; operations that reshape the index space save
//! and rewrite `index` around their child's emission.

use std::collections::{HashMap, VecDeque};

use crate::graph::{Graph, NodeId};
use crate::ops::{broadcast_divisors, Op};
use crate::types::{acc_sizes, FType, Scalar};

pub(crate) struct Generated {
    pub source: String,
    pub parameters: Vec<NodeId>,
}

fn scalar_literal(value: Scalar) -> String {
    match value {
        Scalar::I32(v) => format!("{v}"),
        Scalar::I64(v) => format!("{v}L"),
        Scalar::F32(v) => format!("{:?}f", v),
        Scalar::F64(v) => format!("{:?}", v),
    }
}

fn min_literal(t: FType) -> &'static str {
    match t {
        FType::I32 => "(-2147483647 - 1)",
        FType::I64 => "(-9223372036854775807L - 1L)",
        FType::F32 => "(-3.402823466e+38f)",
        FType::F64 => "(-1.7976931348623157e+308)",
    }
}

fn max_literal(t: FType) -> &'static str {
    match t {
        FType::I32 => "2147483647",
        FType::I64 => "9223372036854775807L",
        FType::F32 => "3.402823466e+38f",
        FType::F64 => "1.7976931348623157e+308",
    }
}

struct State {
    code: String,
    todo: VecDeque<(Option<NodeId>, String)>,
    assigned: HashMap<NodeId, String>,
    parameters: Vec<NodeId>,
    variable_index: usize,
    num_indices: usize,
}

impl State {
    fn prepend(&mut self, text: &str) {
        self.code.insert_str(0, text);
    }

    fn parameter(&mut self, node: NodeId) -> String {
        if let Some(name) = self.assigned.get(&node) {
            return name.clone();
        }
        let name = format!("P{}", self.parameters.len());
        self.parameters.push(node);
        self.assigned.insert(node, name.clone());
        name
    }
}

/// True when the node enters the kernel as a parameter buffer.
fn is_parameter(graph: &Graph, node: NodeId) -> bool {
    graph.node(node).result.is_some() || matches!(graph.node(node).op, Op::Store(_))
}

fn parameter_entries(graph: &Graph, node: NodeId) -> usize {
    match (&graph.node(node).op, &graph.node(node).result) {
        (_, Some(result)) => result.entries,
        (Op::Store(data), None) => data.len(),
        _ => unreachable!("parameter without a buffer"),
    }
}

pub(crate) fn generate(graph: &Graph, root: NodeId) -> Generated {
    let mut state = State {
        code: String::new(),
        todo: VecDeque::new(),
        assigned: HashMap::new(),
        parameters: Vec::new(),
        variable_index: 0,
        num_indices: 0,
    };
    state.todo.push_front((Some(root), "v0".to_string()));
    while let Some((entry, name)) = state.todo.pop_front() {
        let node_id = match entry {
            Some(id) => id,
            None => {
                // literal chunk, typically an index rewrite
                state.prepend(&name);
                continue;
            }
        };
        let node = graph.node(node_id);
        let t = node.ftype.c_name();

        if let Op::Constant(value) = &node.op {
            if node.result.is_none() {
                let line = format!("const {t} {name} = {};\n", scalar_literal(*value));
                state.prepend(&line);
                continue;
            }
        }
        if is_parameter(graph, node_id) {
            let pname = state.parameter(node_id);
            let entries = parameter_entries(graph, node_id);
            let line = format!("const {t} {name} = {pname}[index % {entries}];\n");
            state.prepend(&line);
            continue;
        }

        let preds = node.predecessors.clone();
        let mut push_preds = true;
        let mut index_defs = String::new();
        let vi = state.variable_index;
        match &node.op {
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                let sym = match node.op {
                    Op::Add => "+",
                    Op::Sub => "-",
                    Op::Mul => "*",
                    _ => "/",
                };
                let line = format!("const {t} {name} = v{} {sym} v{};\n", vi + 1, vi + 2);
                state.prepend(&line);
            }
            Op::Pow => {
                let line = format!(
                    "const {t} {name} = ({t})pow((double)v{}, (double)v{});\n",
                    vi + 1,
                    vi + 2
                );
                state.prepend(&line);
            }
            Op::Min => {
                let line = format!(
                    "const {t} {name} = v{b} < v{a} ? v{b} : v{a};\n",
                    a = vi + 1,
                    b = vi + 2
                );
                state.prepend(&line);
            }
            Op::Max => {
                let line = format!(
                    "const {t} {name} = v{a} < v{b} ? v{b} : v{a};\n",
                    a = vi + 1,
                    b = vi + 2
                );
                state.prepend(&line);
            }
            Op::Less => {
                let line = format!(
                    "const {t} {name} = v{} < v{} ? 1 : 0;\n",
                    vi + 1,
                    vi + 2
                );
                state.prepend(&line);
            }
            Op::Equal => {
                let line = format!(
                    "const {t} {name} = v{} == v{} ? 1 : 0;\n",
                    vi + 1,
                    vi + 2
                );
                state.prepend(&line);
            }
            Op::Greater => {
                let line = format!(
                    "const {t} {name} = v{} > v{} ? 1 : 0;\n",
                    vi + 1,
                    vi + 2
                );
                state.prepend(&line);
            }
            Op::Neg => {
                let line = format!("const {t} {name} = -v{};\n", vi + 1);
                state.prepend(&line);
            }
            Op::Abs => {
                let line = format!(
                    "const {t} {name} = v{a} < 0 ? -v{a} : v{a};\n",
                    a = vi + 1
                );
                state.prepend(&line);
            }
            Op::Sign => {
                let line = format!("const {t} {name} = v{} < 0 ? -1 : 1;\n", vi + 1);
                state.prepend(&line);
            }
            Op::Even => {
                let line = format!("const {t} {name} = v{} % 2 == 0 ? 1 : 0;\n", vi + 1);
                state.prepend(&line);
            }
            Op::Log | Op::Log2 | Op::Log10 | Op::Exp | Op::Sqrt | Op::Sin | Op::Cos | Op::Tan
            | Op::Asin | Op::Acos | Op::Atan => {
                let fun = node.op.tag_name();
                let line = format!("const {t} {name} = {fun}(v{});\n", vi + 1);
                state.prepend(&line);
            }
            Op::Convert => {
                let line = format!("const {t} {name} = ({t})v{};\n", vi + 1);
                state.prepend(&line);
            }
            Op::Flatten | Op::Reshape => {
                let line = format!("const {t} {name} = v{};\n", vi + 1);
                state.prepend(&line);
            }
            Op::Slice { start, step } => {
                // the child inherits this node's variable, only the index
                // space changes
                push_preds = false;
                let old = state.num_indices;
                state.num_indices += 1;
                let acc_dst = acc_sizes(&node.shape);
                let acc_src = acc_sizes(&graph.node(preds[0]).shape);
                let offset: i64 = (0..start.len())
                    .map(|d| start[d] * acc_src[d] as i64)
                    .sum();
                index_defs.push_str(&format!("long old_index{old} = index;\nindex = {offset}"));
                for d in 0..start.len() {
                    let source = if d == 0 {
                        "index".to_string()
                    } else {
                        format!("(index % {})", acc_dst[d - 1])
                    };
                    index_defs.push_str(&format!(
                        " + {source} / {} * {}",
                        acc_dst[d],
                        step[d] * acc_src[d] as i64
                    ));
                }
                index_defs.push_str(";\n");
                state.prepend(&format!("index = old_index{old};\n"));
                state.todo.push_front((None, index_defs.clone()));
                index_defs.clear();
                state.todo.push_front((Some(preds[0]), name.clone()));
            }
            Op::Repeat => {
                push_preds = false;
                let old = state.num_indices;
                state.num_indices += 1;
                let acc_dst = acc_sizes(&node.shape);
                let pred_shape = &graph.node(preds[0]).shape;
                let acc_src = acc_sizes(pred_shape);
                index_defs.push_str(&format!(
                    "long old_index{old} = index;\n{{\nlong working_index = index;\nindex = 0;\n"
                ));
                for d in 0..node.shape.len() {
                    index_defs.push_str(&format!(
                        "index += ((working_index / {}) % {}) * {};\nworking_index %= {};\n",
                        acc_dst[d], pred_shape[d], acc_src[d], acc_dst[d]
                    ));
                }
                index_defs.push_str("}\n");
                state.prepend(&format!("index = old_index{old};\n"));
                state.todo.push_front((None, index_defs.clone()));
                index_defs.clear();
                state.todo.push_front((Some(preds[0]), name.clone()));
            }
            Op::Transpose { perm } => {
                push_preds = false;
                let old = state.num_indices;
                state.num_indices += 1;
                let acc_dst = acc_sizes(&node.shape);
                let acc_src = acc_sizes(&graph.node(preds[0]).shape);
                index_defs.push_str(&format!(
                    "long old_index{old} = index;\n{{\nlong working_index = index;\nindex = 0;\n"
                ));
                for d in 0..node.shape.len() {
                    index_defs.push_str(&format!(
                        "index += (working_index / {}) * {};\nworking_index %= {};\n",
                        acc_dst[d],
                        acc_src[perm[d]],
                        acc_dst[d]
                    ));
                }
                index_defs.push_str("}\n");
                state.prepend(&format!("index = old_index{old};\n"));
                state.todo.push_front((None, index_defs.clone()));
                index_defs.clear();
                state.todo.push_front((Some(preds[0]), name.clone()));
            }
            Op::Extend { insert, step } => {
                let old = state.num_indices;
                state.num_indices += 1;
                let acc_dst = acc_sizes(&node.shape);
                let pred_shape = &graph.node(preds[0]).shape;
                let acc_src = acc_sizes(pred_shape);
                index_defs.push_str(&format!(
                    "long old_index{old} = index;\nint cond{old} = 1;\n{{\nlong working_index = index;\nlong src = 0;\n"
                ));
                for d in 0..node.shape.len() {
                    index_defs.push_str(&format!(
                        "{{\nlong pos = working_index / {acc};\nworking_index %= {acc};\n\
                         long rel = pos - {ins};\nlong j = rel / ({st});\n\
                         if (rel % ({st}) != 0 || j < 0 || j >= {ext}) cond{old} = 0;\n\
                         else src += j * {accs};\n}}\n",
                        acc = acc_dst[d],
                        ins = insert[d],
                        st = step[d],
                        ext = pred_shape[d],
                        accs = acc_src[d]
                    ));
                }
                index_defs.push_str("index = src;\n}\n");
                let child = state.variable_index + 1;
                state.prepend(&format!(
                    "index = old_index{old};\nconst {t} {name} = cond{old} ? v{child} : ({t})0;\n"
                ));
            }
            Op::ReduceSum { axis } | Op::ReduceMul { axis } | Op::ReduceMin { axis }
            | Op::ReduceMax { axis } => {
                // the child is read in a loop, so it must be a parameter
                push_preds = false;
                let pname = state.parameter(preds[0]);
                let pred_shape = &graph.node(preds[0]).shape;
                let extent = pred_shape[*axis];
                let it_dim: usize = pred_shape[*axis + 1..].iter().product();
                let access = format!(
                    "{pname}[(index / {it_dim}) * {it_dim} * {extent} + index % {it_dim} + i * {it_dim}]"
                );
                let body = match &node.op {
                    Op::ReduceSum { .. } => format!(
                        "{t} {name} = 0;\nfor (long i = 0; i < {extent}; i++) {{\n{name} += {access};\n}}\n"
                    ),
                    Op::ReduceMul { .. } => format!(
                        "{t} {name} = 1;\nfor (long i = 0; i < {extent}; i++) {{\n{name} *= {access};\n}}\n"
                    ),
                    Op::ReduceMin { .. } => format!(
                        "{t} {name} = {init};\nfor (long i = 0; i < {extent}; i++) {{\n{t} cur = {access};\n{name} = cur < {name} ? cur : {name};\n}}\n",
                        init = max_literal(node.ftype)
                    ),
                    _ => format!(
                        "{t} {name} = {init};\nfor (long i = 0; i < {extent}; i++) {{\n{t} cur = {access};\n{name} = {name} < cur ? cur : {name};\n}}\n",
                        init = min_literal(node.ftype)
                    ),
                };
                state.prepend(&body);
            }
            other => unreachable!(
                "operation {} reached the fused generator, it must be materialized eagerly",
                other.tag_name()
            ),
        }

        // inverse broadcasting splits the child emissions across two index
        // rewrites, one divisor per operand
        if node.inverse_broadcast && preds.len() == 2 {
            let (iv1, iv2) = broadcast_divisors(
                &graph.node(preds[0]).shape,
                &graph.node(preds[1]).shape,
                true,
            );
            if iv1 != 1 || iv2 != 1 {
                push_preds = false;
                let old = format!("old_idx{}", state.num_indices);
                state.num_indices += 1;
                state.prepend(&format!("index = {old};\n"));
                let var1 = state.variable_index + 1;
                let var2 = state.variable_index + 2;
                state.variable_index += 2;
                state
                    .todo
                    .push_front((None, format!("long {old} = index;\nindex /= {iv2};\n")));
                state.todo.push_front((Some(preds[1]), format!("v{var2}")));
                state
                    .todo
                    .push_front((None, format!("index = {old};\nindex /= {iv1};\n")));
                state.todo.push_front((Some(preds[0]), format!("v{var1}")));
            }
        }

        if !index_defs.is_empty() {
            state.todo.push_front((None, index_defs));
        }
        if push_preds {
            for &p in &preds {
                state.variable_index += 1;
                let pname = format!("v{}", state.variable_index);
                state.todo.push_front((Some(p), pname));
            }
        }
    }

    let mut source = String::from(
        "extern \"C\" __global__ void execute_graph(const unsigned long long* PT, long n) {\n\
         long index = blockIdx.x * (long)blockDim.x + threadIdx.x;\nif (index >= n) return;\n",
    );
    source.push_str(&format!(
        "{}* R = ({}*)PT[0];\n",
        graph.ftype(root).c_name(),
        graph.ftype(root).c_name()
    ));
    for (i, &p) in state.parameters.iter().enumerate() {
        let pt = parameter_ftype(graph, p).c_name();
        source.push_str(&format!(
            "const {pt}* P{i} = (const {pt}*)PT[{}];\n",
            i + 1
        ));
    }
    source.push_str(&state.code);
    source.push_str("R[index] = v0;\n}\n");
    Generated {
        source,
        parameters: state.parameters,
    }
}

fn parameter_ftype(graph: &Graph, node: NodeId) -> FType {
    match &graph.node(node).op {
        Op::Store(data) => data.ftype(),
        _ => graph.node(node).ftype,
    }
}
