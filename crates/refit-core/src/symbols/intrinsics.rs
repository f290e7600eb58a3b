//! Intrinsic procedures and modules that never need a declaration.

const INTRINSIC_PROCEDURES: &[&str] = &[
    "abs", "achar", "acos", "acosh", "adjustl", "adjustr", "aimag", "aint", "all",
    "allocated", "anint", "any", "asin", "asinh", "associated", "atan", "atan2", "atanh",
    "bit_size", "btest", "ceiling", "char", "cmplx", "conjg", "cos", "cosh", "count",
    "cpu_time", "cshift", "date_and_time", "dble", "digits", "dim", "dot_product", "dprod",
    "eoshift", "epsilon", "erf", "erfc", "exp", "exponent", "floor", "fraction",
    "get_command_argument", "get_environment_variable", "huge", "iachar", "iand", "ibclr",
    "ibits", "ibset", "ichar", "ieor", "index", "int", "ior", "ishft", "ishftc", "kind",
    "lbound", "len", "len_trim", "log", "log10", "logical", "matmul", "max", "maxloc",
    "maxval", "merge", "min", "minloc", "minval", "mod", "modulo", "move_alloc", "mvbits",
    "nint", "norm2", "not", "null", "pack", "precision", "present", "product", "radix",
    "random_number", "random_seed", "range", "real", "repeat", "reshape", "scan",
    "selected_int_kind", "selected_real_kind", "shape", "sign", "sin", "sinh", "size",
    "spacing", "spread", "sqrt", "storage_size", "sum", "system_clock", "tan", "tanh",
    "tiny", "transfer", "transpose", "trim", "ubound", "unpack", "verify",
];

const INTRINSIC_MODULES: &[&str] = &[
    "iso_c_binding",
    "iso_fortran_env",
    "ieee_arithmetic",
    "ieee_exceptions",
    "ieee_features",
    "omp_lib",
    "openacc",
];

/// True for procedures provided by the language itself.
pub fn is_intrinsic_procedure(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    INTRINSIC_PROCEDURES.binary_search(&lower.as_str()).is_ok()
}

/// True for modules provided by the compiler runtime.
pub fn is_intrinsic_module(name: &str) -> bool {
    INTRINSIC_MODULES
        .iter()
        .any(|m| m.eq_ignore_ascii_case(name))
}
