//! Eager code generation: one parameterized kernel per (operation, result
//! type, parameter types) combination. The fixed launch layout is a pointer
//! table (result buffer first, parameters after) plus an int64 metadata
//! array carrying element counts, accumulator strides, shapes and window
//! descriptions, so one compiled kernel serves every node of its kind.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::graph::{Graph, NodeId};
use crate::ops::{broadcast_divisors, Op};
use crate::types::{acc_sizes, window_count, FType};

pub(crate) fn cache_key(op: &Op, res: FType, params: &[FType]) -> u64 {
    let mut hasher = DefaultHasher::new();
    op.tag_name().hash(&mut hasher);
    (res as u8).hash(&mut hasher);
    for &p in params {
        (p as u8).hash(&mut hasher);
    }
    hasher.finish()
}

fn prologue(op: &Op, res: FType, params: &[FType]) -> String {
    let mut src = format!(
        "// {}\nextern \"C\" __global__ void execute_op(const unsigned long long* PT, \
         const long* META, long n) {{\n\
         long index = blockIdx.x * (long)blockDim.x + threadIdx.x;\nif (index >= n) return;\n",
        op.tag_name()
    );
    src.push_str(&format!("{t}* R = ({t}*)PT[0];\n", t = res.c_name()));
    for (i, p) in params.iter().enumerate() {
        src.push_str(&format!(
            "const {t}* P{i} = (const {t}*)PT[{}];\n",
            i + 1,
            t = p.c_name()
        ));
    }
    src
}

pub(crate) fn source(op: &Op, res: FType, params: &[FType]) -> String {
    let t = res.c_name();
    let mut src = prologue(op, res, params);
    let body = match op {
        Op::Store(_) | Op::Flatten | Op::Reshape => format!("R[index] = ({t})P0[index];\n"),
        Op::Constant(_) => format!("R[index] = ({t})P0[0];\n"),
        Op::Arange { .. } => "R[index] = (index / META[0]) % META[1];\n".to_string(),
        Op::Random { .. } => "double r = sin(((double)index + 1.0) * 12.9898 + \
             __longlong_as_double(META[0])) * 43758.5453;\n\
             R[index] = r - floor(r);\n"
            .to_string(),
        Op::Dropout { .. } => format!(
            "double r = sin(((double)index + 1.0) * 12.9898 + \
             __longlong_as_double(META[0])) * 43758.5453;\n\
             r = r - floor(r);\n\
             R[index] = r < __longlong_as_double(META[1]) ? ({t})0 : P0[index];\n"
        ),
        Op::Add | Op::Sub | Op::Mul | Op::Div => {
            let sym = match op {
                Op::Add => "+",
                Op::Sub => "-",
                Op::Mul => "*",
                _ => "/",
            };
            format!(
                "const {t} x = ({t})P0[(index / META[1]) % META[0]];\n\
                 const {t} y = ({t})P1[(index / META[3]) % META[2]];\n\
                 R[index] = x {sym} y;\n"
            )
        }
        Op::Pow => format!(
            "const double x = (double)P0[(index / META[1]) % META[0]];\n\
             const double y = (double)P1[(index / META[3]) % META[2]];\n\
             R[index] = ({t})pow(x, y);\n"
        ),
        Op::Min => format!(
            "const {t} x = ({t})P0[(index / META[1]) % META[0]];\n\
             const {t} y = ({t})P1[(index / META[3]) % META[2]];\n\
             R[index] = y < x ? y : x;\n"
        ),
        Op::Max => format!(
            "const {t} x = ({t})P0[(index / META[1]) % META[0]];\n\
             const {t} y = ({t})P1[(index / META[3]) % META[2]];\n\
             R[index] = x < y ? y : x;\n"
        ),
        Op::Less | Op::Equal | Op::Greater => {
            let sym = match op {
                Op::Less => "<",
                Op::Equal => "==",
                _ => ">",
            };
            format!(
                "const double x = (double)P0[(index / META[1]) % META[0]];\n\
                 const double y = (double)P1[(index / META[3]) % META[2]];\n\
                 R[index] = x {sym} y ? 1 : 0;\n"
            )
        }
        Op::Neg => "R[index] = -P0[index];\n".to_string(),
        Op::Abs => format!("const {t} v = P0[index];\nR[index] = v < 0 ? -v : v;\n"),
        Op::Sign => "R[index] = P0[index] < 0 ? -1 : 1;\n".to_string(),
        Op::Even => "R[index] = P0[index] % 2 == 0 ? 1 : 0;\n".to_string(),
        Op::Log | Op::Log2 | Op::Log10 | Op::Exp | Op::Sqrt | Op::Sin | Op::Cos | Op::Tan
        | Op::Asin | Op::Acos | Op::Atan => {
            format!("R[index] = {}(P0[index]);\n", op.tag_name())
        }
        Op::Convert => format!("R[index] = ({t})P0[index];\n"),
        Op::ReduceSum { .. } | Op::ReduceMul { .. } | Op::ReduceMin { .. }
        | Op::ReduceMax { .. } => {
            let (init, fold) = match op {
                Op::ReduceSum { .. } => ("0".to_string(), "acc += cur;".to_string()),
                Op::ReduceMul { .. } => ("1".to_string(), "acc *= cur;".to_string()),
                Op::ReduceMin { .. } => (
                    max_literal(res).to_string(),
                    "acc = cur < acc ? cur : acc;".to_string(),
                ),
                _ => (
                    min_literal(res).to_string(),
                    "acc = acc < cur ? cur : acc;".to_string(),
                ),
            };
            format!(
                "const long extent = META[0];\nconst long it = META[1];\n\
                 {t} acc = {init};\n\
                 for (long i = 0; i < extent; i++) {{\n\
                 {t} cur = P0[(index / it) * it * extent + index % it + i * it];\n\
                 {fold}\n}}\nR[index] = acc;\n"
            )
        }
        Op::Transpose { .. } => "const long rank = META[0];\n\
             const long* AD = META + 1;\n\
             const long* AS = META + 1 + rank;\n\
             long rest = index;\nlong src = 0;\n\
             for (long d = 0; d < rank; d++) {\n\
             src += (rest / AD[d]) * AS[d];\nrest %= AD[d];\n}\n\
             R[index] = P0[src];\n"
            .to_string(),
        Op::Repeat => "const long rank = META[0];\n\
             const long* AD = META + 1;\n\
             const long* AS = META + 1 + rank;\n\
             const long* S = META + 1 + 2 * rank;\n\
             long rest = index;\nlong src = 0;\n\
             for (long d = 0; d < rank; d++) {\n\
             src += ((rest / AD[d]) % S[d]) * AS[d];\nrest %= AD[d];\n}\n\
             R[index] = P0[src];\n"
            .to_string(),
        Op::Slice { .. } => "const long rank = META[0];\n\
             const long* AD = META + 1;\n\
             const long* AS = META + 1 + rank;\n\
             const long* SH = META + 1 + 2 * rank;\n\
             const long* ST = META + 1 + 3 * rank;\n\
             const long* SP = META + 1 + 4 * rank;\n\
             long rest = index;\nlong src = 0;\n\
             for (long d = 0; d < rank; d++) {\n\
             long pos = (rest / AD[d]) % SH[d];\nrest %= AD[d];\n\
             src += (ST[d] + pos * SP[d]) * AS[d];\n}\n\
             R[index] = P0[src];\n"
            .to_string(),
        Op::Extend { .. } => format!(
            "const long rank = META[0];\n\
             const long* AD = META + 1;\n\
             const long* AS = META + 1 + rank;\n\
             const long* SH = META + 1 + 2 * rank;\n\
             const long* SS = META + 1 + 3 * rank;\n\
             const long* IN = META + 1 + 4 * rank;\n\
             const long* SP = META + 1 + 5 * rank;\n\
             long rest = index;\nlong src = 0;\nint cond = 1;\n\
             for (long d = 0; d < rank; d++) {{\n\
             long pos = (rest / AD[d]) % SH[d];\nrest %= AD[d];\n\
             long rel = pos - IN[d];\nlong j = rel / SP[d];\n\
             if (rel % SP[d] != 0 || j < 0 || j >= SS[d]) cond = 0;\n\
             else src += j * AS[d];\n}}\n\
             R[index] = cond ? P0[src] : ({t})0;\n"
        ),
        Op::Concat { .. } => "const long rank = META[0];\n\
             const long axis = META[1];\n\
             const long split = META[2];\n\
             const long* AD = META + 3;\n\
             const long* AA = META + 3 + rank;\n\
             const long* AB = META + 3 + 2 * rank;\n\
             const long* SH = META + 3 + 3 * rank;\n\
             long rest = index;\nlong coords[16];\n\
             for (long d = 0; d < rank; d++) {\n\
             coords[d] = (rest / AD[d]) % SH[d];\nrest %= AD[d];\n}\n\
             if (coords[axis] < split) {\n\
             long src = 0;\n\
             for (long d = 0; d < rank; d++) src += coords[d] * AA[d];\n\
             R[index] = P0[src];\n} else {\n\
             coords[axis] -= split;\n\
             long src = 0;\n\
             for (long d = 0; d < rank; d++) src += coords[d] * AB[d];\n\
             R[index] = P1[src];\n}\n"
            .to_string(),
        Op::Index => "const long rank = META[0];\n\
             const long ax = META[1];\n\
             const long* AD = META + 2;\n\
             const long* AS = META + 2 + rank;\n\
             const long* AI = META + 2 + 2 * rank;\n\
             const long* SH = META + 2 + 3 * rank;\n\
             long rest = index;\nlong src = 0;\nlong idx_flat = 0;\n\
             for (long d = 0; d < rank; d++) {\n\
             long coord = (rest / AD[d]) % SH[d];\nrest %= AD[d];\n\
             if (d < ax) { idx_flat += coord * AI[d]; src += coord * AS[d]; }\n\
             else if (d == ax) { idx_flat += coord * AI[d]; src += (long)P1[idx_flat] * AS[d]; }\n\
             else { src += coord * AS[d]; }\n}\n\
             R[index] = P0[src];\n"
            .to_string(),
        Op::IndexSet => format!(
            "const long rank = META[0];\n\
             const long ax = META[1];\n\
             const long sel = META[2];\n\
             const long* AD = META + 3;\n\
             const long* AB = META + 3 + rank;\n\
             const long* AI = META + 3 + 2 * rank;\n\
             const long* SH = META + 3 + 3 * rank;\n\
             long rest = index;\nlong idx_base = 0;\nlong b_base = 0;\nlong target = 0;\n\
             for (long d = 0; d < rank; d++) {{\n\
             long coord = (rest / AD[d]) % SH[d];\nrest %= AD[d];\n\
             if (d < ax) {{ idx_base += coord * AI[d]; b_base += coord * AB[d]; }}\n\
             else if (d == ax) {{ target = coord; }}\n\
             else {{ b_base += coord * AB[d]; }}\n}}\n\
             {t} value = P0[index];\n\
             for (long j = 0; j < sel; j++) {{\n\
             if ((long)P2[idx_base + j * AI[ax]] == target) value = P1[b_base + j * AB[ax]];\n}}\n\
             R[index] = value;\n"
        ),
        Op::SlidingWindow { .. } => "const long rank = META[0];\n\
             const long we = META[1];\n\
             const long* ASRC = META + 2;\n\
             const long* AWIN = META + 2 + rank;\n\
             const long* WACC = META + 2 + 2 * rank;\n\
             const long* SP = META + 2 + 3 * rank;\n\
             long window = index / we;\nlong offset = index % we;\nlong src = 0;\n\
             for (long d = 0; d < rank; d++) {\n\
             long w = window / WACC[d];\nwindow %= WACC[d];\n\
             long k = offset / AWIN[d];\noffset %= AWIN[d];\n\
             src += (w * SP[d] + k) * ASRC[d];\n}\n\
             R[index] = P0[src];\n"
            .to_string(),
        Op::UnslideWindow { .. } => format!(
            "const long rank = META[0];\n\
             const long we = META[1];\n\
             const long* AD = META + 2;\n\
             const long* SH = META + 2 + rank;\n\
             const long* AWIN = META + 2 + 2 * rank;\n\
             const long* WC = META + 2 + 3 * rank;\n\
             const long* SZ = META + 2 + 4 * rank;\n\
             const long* SP = META + 2 + 5 * rank;\n\
             long rest = index;\nlong pos[16];\n\
             for (long d = 0; d < rank; d++) {{\n\
             pos[d] = (rest / AD[d]) % SH[d];\nrest %= AD[d];\n}}\n\
             long w[16]; long wlo[16]; long whi[16];\nint any = 1;\n\
             for (long d = 0; d < rank; d++) {{\n\
             long lo = pos[d] >= SZ[d] ? (pos[d] - SZ[d]) / SP[d] + 1 : 0;\n\
             long hi = pos[d] / SP[d];\nif (hi > WC[d] - 1) hi = WC[d] - 1;\n\
             if (lo > hi) any = 0;\n\
             wlo[d] = lo;\nwhi[d] = hi;\nw[d] = lo;\n}}\n\
             {t} acc = 0;\n\
             while (any) {{\n\
             long window = 0;\nlong offset = 0;\n\
             for (long d = 0; d < rank; d++) {{\n\
             window = window * WC[d] + w[d];\n\
             offset += (pos[d] - w[d] * SP[d]) * AWIN[d];\n}}\n\
             acc += P0[window * we + offset];\n\
             long d = rank - 1;\n\
             while (d >= 0) {{\n\
             w[d]++;\nif (w[d] <= whi[d]) break;\nw[d] = wlo[d];\nd--;\n}}\n\
             if (d < 0) break;\n}}\n\
             R[index] = acc;\n"
        ),
        Op::Convolve { .. } => format!(
            "const long s = META[0];\n\
             const long multi = META[1];\n\
             const long filters = META[2];\n\
             const long ke = META[3];\n\
             const long* SP = META + 4;\n\
             const long* AIN = META + 4 + s;\n\
             const long* AKW = META + 4 + 2 * s;\n\
             const long* AOUT = META + 4 + 3 * s;\n\
             const long* OSH = META + 4 + 4 * s;\n\
             long filter = multi ? index % filters : 0;\n\
             long rest = index;\nlong origin = 0;\n\
             for (long d = 0; d < s; d++) {{\n\
             long w = (rest / AOUT[d]) % OSH[d];\nrest %= AOUT[d];\n\
             origin += w * SP[d] * AIN[d];\n}}\n\
             {t} acc = 0;\n\
             for (long kk = 0; kk < ke; kk++) {{\n\
             long kr = kk;\nlong src = origin;\n\
             for (long d = 0; d < s; d++) {{\n\
             src += (kr / AKW[d]) * AIN[d];\nkr %= AKW[d];\n}}\n\
             src += kr;\n\
             acc += P0[src] * P1[filter * ke + kk];\n}}\n\
             R[index] = acc;\n"
        ),
        Op::GradientConvolve1 { .. } => format!(
            "const long s = META[0];\n\
             const long multi = META[1];\n\
             const long filters = META[2];\n\
             const long ke = META[3];\n\
             const long* WC = META + 4;\n\
             const long* SP = META + 4 + s;\n\
             const long* AIN = META + 4 + 2 * s;\n\
             const long* NSH = META + 4 + 3 * s;\n\
             const long* AKW = META + 4 + 4 * s;\n\
             const long* AADJ = META + 4 + 5 * s;\n\
             const long* KSZ = META + 4 + 6 * s;\n\
             long rest = index;\nlong pos[16];\n\
             for (long d = 0; d < s; d++) {{\n\
             pos[d] = (rest / AIN[d]) % NSH[d];\nrest %= AIN[d];\n}}\n\
             long channel = rest;\n\
             {t} acc = 0;\n\
             long k[16];\nfor (long d = 0; d < s; d++) k[d] = 0;\n\
             while (1) {{\n\
             long adj_idx = 0;\nlong kflat = 0;\nint valid = 1;\n\
             for (long d = 0; d < s; d++) {{\n\
             kflat += k[d] * AKW[d];\n\
             if (!valid) continue;\n\
             if (pos[d] < k[d]) {{ valid = 0; continue; }}\n\
             long rel = pos[d] - k[d];\n\
             if (rel % SP[d] != 0) {{ valid = 0; continue; }}\n\
             long w = rel / SP[d];\n\
             if (w >= WC[d]) {{ valid = 0; continue; }}\n\
             adj_idx += w * AADJ[d];\n}}\n\
             if (valid) {{\n\
             long kf = kflat + channel;\n\
             for (long f = 0; f < filters; f++) {{\n\
             long ai = multi ? adj_idx + f : adj_idx;\n\
             acc += P1[ai] * P0[f * ke + kf];\n}}\n}}\n\
             long d = s - 1;\n\
             while (d >= 0) {{\n\
             k[d]++;\nif (k[d] < KSZ[d]) break;\nk[d] = 0;\nd--;\n}}\n\
             if (d < 0) break;\n}}\n\
             R[index] = acc;\n"
        ),
        Op::GradientConvolve2 { .. } => format!(
            "const long s = META[0];\n\
             const long multi = META[1];\n\
             const long ke = META[3];\n\
             const long* WC = META + 4;\n\
             const long* SP = META + 4 + s;\n\
             const long* AIN = META + 4 + 2 * s;\n\
             const long* AKW = META + 4 + 3 * s;\n\
             const long* AADJ = META + 4 + 4 * s;\n\
             long filter = multi ? index / ke : 0;\n\
             long kr = index % ke;\nlong koff = 0;\n\
             for (long d = 0; d < s; d++) {{\n\
             koff += (kr / AKW[d]) * AIN[d];\nkr %= AKW[d];\n}}\n\
             koff += kr;\n\
             {t} acc = 0;\n\
             long w[16];\nfor (long d = 0; d < s; d++) w[d] = 0;\n\
             while (1) {{\n\
             long origin = 0;\nlong adj_idx = 0;\n\
             for (long d = 0; d < s; d++) {{\n\
             origin += w[d] * SP[d] * AIN[d];\n\
             adj_idx += w[d] * AADJ[d];\n}}\n\
             if (multi) adj_idx += filter;\n\
             acc += P1[adj_idx] * P0[origin + koff];\n\
             long d = s - 1;\n\
             while (d >= 0) {{\n\
             w[d]++;\nif (w[d] < WC[d]) break;\nw[d] = 0;\nd--;\n}}\n\
             if (d < 0) break;\n}}\n\
             R[index] = acc;\n"
        ),
        Op::PoolingSum { .. } | Op::PoolingMax { .. } => {
            let fold = if matches!(op, Op::PoolingSum { .. }) {
                "acc += v;"
            } else {
                "acc = acc < v ? v : acc;"
            };
            let init = if matches!(op, Op::PoolingSum { .. }) {
                "0".to_string()
            } else {
                min_literal(res).to_string()
            };
            format!(
                "const long s = META[0];\n\
                 const long* SP = META + 1;\n\
                 const long* AIN = META + 1 + s;\n\
                 const long* AOUT = META + 2 + 2 * s;\n\
                 const long* OSH = META + 2 + 3 * s;\n\
                 const long* WL = META + 2 + 4 * s;\n\
                 long rest = index;\nlong origin = 0;\n\
                 for (long d = 0; d < s; d++) {{\n\
                 long w = (rest / AOUT[d]) % OSH[d];\nrest %= AOUT[d];\n\
                 origin += w * SP[d] * AIN[d];\n}}\n\
                 {t} acc = {init};\n\
                 long o[16];\nfor (long d = 0; d <= s; d++) o[d] = 0;\n\
                 while (1) {{\n\
                 long src = origin;\n\
                 for (long d = 0; d <= s; d++) src += o[d] * AIN[d];\n\
                 {t} v = P0[src];\n\
                 {fold}\n\
                 long d = s;\n\
                 while (d >= 0) {{\n\
                 o[d]++;\nif (o[d] < WL[d]) break;\no[d] = 0;\nd--;\n}}\n\
                 if (d < 0) break;\n}}\n\
                 R[index] = acc;\n"
            )
        }
        Op::GradientPoolingMax { .. } => format!(
            "const long s = META[0];\n\
             const long* SP = META + 1;\n\
             const long* AIN = META + 1 + s;\n\
             const long* NSH = META + 2 + 2 * s;\n\
             const long* WC = META + 3 + 3 * s;\n\
             const long* WL = META + 3 + 4 * s;\n\
             const long* AADJ = META + 4 + 5 * s;\n\
             long rest = index;\nlong pos[16];\n\
             for (long d = 0; d <= s; d++) {{\n\
             pos[d] = (rest / AIN[d]) % NSH[d];\nrest %= AIN[d];\n}}\n\
             long w[16]; long wlo[16]; long whi[16];\nint any = 1;\n\
             for (long d = 0; d < s; d++) {{\n\
             long lo = pos[d] >= WL[d] ? (pos[d] - WL[d]) / SP[d] + 1 : 0;\n\
             long hi = pos[d] / SP[d];\nif (hi > WC[d] - 1) hi = WC[d] - 1;\n\
             if (lo > hi) any = 0;\n\
             wlo[d] = lo;\nwhi[d] = hi;\nw[d] = lo;\n}}\n\
             {t} acc = 0;\n\
             while (any) {{\n\
             long origin = 0;\nlong adj_idx = 0;\n\
             for (long d = 0; d < s; d++) {{\n\
             origin += w[d] * SP[d] * AIN[d];\n\
             adj_idx += w[d] * AADJ[d];\n}}\n\
             long o[16];\nfor (long d = 0; d <= s; d++) o[d] = 0;\n\
             {t} best = P0[origin];\nlong best_src = origin;\nint first = 1;\n\
             while (1) {{\n\
             long src = origin;\n\
             for (long d = 0; d <= s; d++) src += o[d] * AIN[d];\n\
             {t} v = P0[src];\n\
             if (first || best < v) {{ best = v; best_src = src; first = 0; }}\n\
             long d = s;\n\
             while (d >= 0) {{\n\
             o[d]++;\nif (o[d] < WL[d]) break;\no[d] = 0;\nd--;\n}}\n\
             if (d < 0) break;\n}}\n\
             if (best_src == index) acc += P1[adj_idx];\n\
             long d = s - 1;\n\
             while (d >= 0) {{\n\
             w[d]++;\nif (w[d] <= whi[d]) break;\nw[d] = wlo[d];\nd--;\n}}\n\
             if (d < 0) break;\n}}\n\
             R[index] = acc;\n"
        ),
    };
    src.push_str(&body);
    src.push_str("}\n");
    src
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

fn push_usizes(meta: &mut Vec<i64>, values: &[usize]) {
    meta.extend(values.iter().map(|&v| v as i64));
}

/// Builds the metadata array of one node; the layout must match the offsets
/// baked into [`source`] for the node's operation kind.
pub(crate) fn meta(graph: &Graph, node: NodeId) -> Vec<i64> {
    let n = graph.node(node);
    let shape = &n.shape;
    let preds = &n.predecessors;
    let mut meta: Vec<i64> = Vec::new();
    match &n.op {
        Op::Store(_) | Op::Constant(_) | Op::Flatten | Op::Reshape | Op::Neg | Op::Abs
        | Op::Sign | Op::Even | Op::Log | Op::Log2 | Op::Log10 | Op::Exp | Op::Sqrt | Op::Sin
        | Op::Cos | Op::Tan | Op::Asin | Op::Acos | Op::Atan | Op::Convert => {}
        Op::Arange { axis } => {
            let acc = acc_sizes(shape);
            meta.push(acc[*axis] as i64);
            meta.push(shape[*axis] as i64);
        }
        Op::Random { seed } => {
            meta.push(seed.to_bits() as i64);
        }
        Op::Dropout { seed, p } => {
            meta.push(seed.to_bits() as i64);
            meta.push(p.to_bits() as i64);
        }
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow | Op::Min | Op::Max | Op::Less
        | Op::Equal | Op::Greater => {
            let sa = &graph.node(preds[0]).shape;
            let sb = &graph.node(preds[1]).shape;
            let (da, db) = broadcast_divisors(sa, sb, n.inverse_broadcast);
            meta.push(crate::types::shape_size(sa).max(1) as i64);
            meta.push(da as i64);
            meta.push(crate::types::shape_size(sb).max(1) as i64);
            meta.push(db as i64);
        }
        Op::ReduceSum { axis } | Op::ReduceMul { axis } | Op::ReduceMin { axis }
        | Op::ReduceMax { axis } => {
            let pred_shape = &graph.node(preds[0]).shape;
            meta.push(pred_shape[*axis] as i64);
            meta.push(pred_shape[*axis + 1..].iter().product::<usize>() as i64);
        }
        Op::Transpose { perm } => {
            let acc_src = acc_sizes(&graph.node(preds[0]).shape);
            meta.push(shape.len() as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            let permuted: Vec<usize> = perm.iter().map(|&p| acc_src[p]).collect();
            push_usizes(&mut meta, &permuted);
        }
        Op::Repeat => {
            meta.push(shape.len() as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[0]).shape));
            push_usizes(&mut meta, &graph.node(preds[0]).shape);
        }
        Op::Slice { start, step } => {
            meta.push(shape.len() as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[0]).shape));
            push_usizes(&mut meta, shape);
            meta.extend(start.iter());
            meta.extend(step.iter());
        }
        Op::Extend { insert, step } => {
            meta.push(shape.len() as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[0]).shape));
            push_usizes(&mut meta, shape);
            push_usizes(&mut meta, &graph.node(preds[0]).shape);
            push_usizes(&mut meta, insert);
            meta.extend(step.iter());
        }
        Op::Concat { axis } => {
            meta.push(shape.len() as i64);
            meta.push(*axis as i64);
            meta.push(graph.node(preds[0]).shape[*axis] as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[0]).shape));
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[1]).shape));
            push_usizes(&mut meta, shape);
        }
        Op::Index => {
            let idx_shape = &graph.node(preds[1]).shape;
            let ax = idx_shape.len() - 1;
            meta.push(shape.len() as i64);
            meta.push(ax as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[0]).shape));
            push_usizes(&mut meta, &acc_sizes(idx_shape));
            push_usizes(&mut meta, shape);
        }
        Op::IndexSet => {
            let idx_shape = &graph.node(preds[2]).shape;
            let ax = idx_shape.len() - 1;
            meta.push(shape.len() as i64);
            meta.push(ax as i64);
            meta.push(idx_shape[ax] as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[1]).shape));
            push_usizes(&mut meta, &acc_sizes(idx_shape));
            push_usizes(&mut meta, shape);
        }
        Op::SlidingWindow { size, steps } => {
            let src_shape = &graph.node(preds[0]).shape;
            let win_counts: Vec<usize> = (0..size.len())
                .map(|d| window_count(src_shape[d], size[d], steps[d]))
                .collect();
            let mut wacc = vec![1usize; size.len()];
            for d in (0..size.len().saturating_sub(1)).rev() {
                wacc[d] = wacc[d + 1] * win_counts[d + 1];
            }
            meta.push(size.len() as i64);
            meta.push(size.iter().product::<usize>() as i64);
            push_usizes(&mut meta, &acc_sizes(src_shape));
            push_usizes(&mut meta, &acc_sizes(size));
            push_usizes(&mut meta, &wacc);
            push_usizes(&mut meta, steps);
        }
        Op::UnslideWindow { steps } => {
            let win_shape = &graph.node(preds[0]).shape;
            let size = &win_shape[1..];
            let win_counts: Vec<usize> = (0..size.len())
                .map(|d| window_count(shape[d], size[d], steps[d]))
                .collect();
            meta.push(shape.len() as i64);
            meta.push(size.iter().product::<usize>() as i64);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, shape);
            push_usizes(&mut meta, &acc_sizes(size));
            push_usizes(&mut meta, &win_counts);
            push_usizes(&mut meta, size);
            push_usizes(&mut meta, steps);
        }
        Op::Convolve { steps } => {
            let input_shape = &graph.node(preds[0]).shape;
            let kernel_shape = &graph.node(preds[1]).shape;
            let g = conv_meta(input_shape, kernel_shape, steps);
            meta.extend(g.header);
            push_usizes(&mut meta, steps);
            push_usizes(&mut meta, &g.acc_input);
            push_usizes(&mut meta, &g.acc_kwin);
            push_usizes(&mut meta, &acc_sizes(shape)[..g.spatial]);
            push_usizes(&mut meta, &shape[..g.spatial]);
        }
        Op::GradientConvolve1 { steps } => {
            let kernel_shape = &graph.node(preds[0]).shape;
            let g = conv_meta(shape, kernel_shape, steps);
            meta.extend(g.header);
            push_usizes(&mut meta, &g.win_counts);
            push_usizes(&mut meta, steps);
            push_usizes(&mut meta, &g.acc_input);
            push_usizes(&mut meta, &shape[..g.spatial]);
            push_usizes(&mut meta, &g.acc_kwin);
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[1]).shape)[..g.spatial]);
            push_usizes(&mut meta, &g.kernel_sizes);
        }
        Op::GradientConvolve2 { steps } => {
            let input_shape = &graph.node(preds[0]).shape;
            let g = conv_meta(input_shape, shape, steps);
            meta.extend(g.header);
            push_usizes(&mut meta, &g.win_counts);
            push_usizes(&mut meta, steps);
            push_usizes(&mut meta, &g.acc_input);
            push_usizes(&mut meta, &g.acc_kwin);
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[1]).shape)[..g.spatial]);
        }
        Op::PoolingSum { size, steps } | Op::PoolingMax { size, steps } => {
            let src_shape = &graph.node(preds[0]).shape;
            let spatial = src_shape.len() - 1;
            let mut limits = size.clone();
            limits.push(src_shape[spatial]);
            meta.push(spatial as i64);
            push_usizes(&mut meta, steps);
            push_usizes(&mut meta, &acc_sizes(src_shape));
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, shape);
            push_usizes(&mut meta, &limits);
        }
        Op::GradientPoolingMax { size, steps } => {
            let spatial = shape.len() - 1;
            let mut limits = size.clone();
            limits.push(shape[spatial]);
            let win_counts: Vec<usize> = (0..spatial)
                .map(|d| window_count(shape[d], size[d], steps[d]))
                .collect();
            meta.push(spatial as i64);
            push_usizes(&mut meta, steps);
            push_usizes(&mut meta, &acc_sizes(shape));
            push_usizes(&mut meta, shape);
            push_usizes(&mut meta, &win_counts);
            push_usizes(&mut meta, &limits);
            push_usizes(&mut meta, &acc_sizes(&graph.node(preds[1]).shape));
        }
    }
    meta
}

struct ConvMeta {
    header: [i64; 4],
    spatial: usize,
    kernel_sizes: Vec<usize>,
    win_counts: Vec<usize>,
    acc_input: Vec<usize>,
    acc_kwin: Vec<usize>,
}

fn conv_meta(input_shape: &[usize], kernel_shape: &[usize], steps: &[usize]) -> ConvMeta {
    let spatial = input_shape.len() - 1;
    let multi = kernel_shape.len() == input_shape.len() + 1;
    let filters = if multi { kernel_shape[0] } else { 1 };
    let kernel_sizes: Vec<usize> = if multi {
        kernel_shape[1..kernel_shape.len() - 1].to_vec()
    } else {
        kernel_shape[..kernel_shape.len() - 1].to_vec()
    };
    let channels = input_shape[spatial];
    let win_counts: Vec<usize> = (0..spatial)
        .map(|d| window_count(input_shape[d], kernel_sizes[d], steps[d]))
        .collect();
    let kernel_elems = kernel_sizes.iter().product::<usize>() * channels;
    let mut kwin = kernel_sizes.clone();
    kwin.push(channels);
    ConvMeta {
        header: [
            spatial as i64,
            multi as i64,
            filters as i64,
            kernel_elems as i64,
        ],
        spatial,
        kernel_sizes,
        win_counts,
        acc_input: acc_sizes(input_shape)[..spatial].to_vec(),
        acc_kwin: acc_sizes(&kwin)[..spatial].to_vec(),
    }
}
