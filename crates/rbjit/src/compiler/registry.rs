//! Runtime helper registry.
//!
//! Maps every helper name the translator can reference to its typed
//! signature. A helper is declared in the module the first time it is looked
//! up; later lookups return the cached declaration so each name appears in
//! the module exactly once. The helpers themselves live in the host runtime
//! and are resolved at module-link time — compilation only declares them.

use crate::error::{CompileError, Result};
use crate::ir::{FuncId, FuncSig, Module, Ty};

struct HelperSig {
    ret: Ty,
    params: &'static [Ty],
    variadic: bool,
}

const I64: Ty = Ty::I64;
const I32: Ty = Ty::I32;

/// Signature shared by the three dispatch helpers:
/// (thread, frame, call-info, call-cache, iseq-or-none, stack-size, receiver,
/// args...).
const DISPATCH: HelperSig = HelperSig {
    ret: I64,
    params: &[I64, I64, I64, I64, I64, I32, I64],
    variadic: true,
};

static HELPERS: &[(&str, HelperSig)] = &[
    // Generic dispatch.
    (
        "rb_funcall",
        HelperSig {
            ret: I64,
            params: &[I64, I64, I32],
            variadic: true,
        },
    ),
    ("send", DISPATCH),
    ("opt_send_without_block", DISPATCH),
    ("invokesuper", DISPATCH),
    // Frame access and method exit.
    (
        "self_from_cfp",
        HelperSig {
            ret: I64,
            params: &[I64],
            variadic: false,
        },
    ),
    (
        "push_result",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "insn_throw",
        HelperSig {
            ret: I64,
            params: &[I64, I64, I64, I64],
            variadic: false,
        },
    ),
    // Specialized arithmetic/comparison.
    (
        "opt_plus",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "opt_minus",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "opt_lt",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    // Variable and constant access.
    (
        "getglobal",
        HelperSig {
            ret: I64,
            params: &[I64],
            variadic: false,
        },
    ),
    (
        "setglobal",
        HelperSig {
            ret: Ty::Void,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "getinstancevariable",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "setinstancevariable",
        HelperSig {
            ret: Ty::Void,
            params: &[I64, I64, I64],
            variadic: false,
        },
    ),
    (
        "getclassvariable",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "setclassvariable",
        HelperSig {
            ret: Ty::Void,
            params: &[I64, I64, I64],
            variadic: false,
        },
    ),
    (
        "getconstant",
        HelperSig {
            ret: I64,
            params: &[I64, I64, I64],
            variadic: false,
        },
    ),
    (
        "setconstant",
        HelperSig {
            ret: Ty::Void,
            params: &[I64, I64, I64],
            variadic: false,
        },
    ),
    (
        "getspecial",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "setspecial",
        HelperSig {
            ret: Ty::Void,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "getlocal_level0",
        HelperSig {
            ret: I64,
            params: &[I64, I32],
            variadic: false,
        },
    ),
    (
        "setlocal_level0",
        HelperSig {
            ret: Ty::Void,
            params: &[I64, I32, I64],
            variadic: false,
        },
    ),
    // Object construction.
    (
        "putspecialobject",
        HelperSig {
            ret: I64,
            params: &[I64],
            variadic: false,
        },
    ),
    (
        "putstring",
        HelperSig {
            ret: I64,
            params: &[I64],
            variadic: false,
        },
    ),
    (
        "newarray",
        HelperSig {
            ret: I64,
            params: &[I32],
            variadic: true,
        },
    ),
    (
        "duparray",
        HelperSig {
            ret: I64,
            params: &[I64],
            variadic: false,
        },
    ),
    (
        "concatarray",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "splatarray",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    (
        "newhash",
        HelperSig {
            ret: I64,
            params: &[I32],
            variadic: true,
        },
    ),
    (
        "newrange",
        HelperSig {
            ret: I64,
            params: &[I64, I64, I32],
            variadic: false,
        },
    ),
    (
        "toregexp",
        HelperSig {
            ret: I64,
            params: &[I32, I32],
            variadic: true,
        },
    ),
    (
        "concatstrings",
        HelperSig {
            ret: I64,
            params: &[I32],
            variadic: true,
        },
    ),
    (
        "tostring",
        HelperSig {
            ret: I64,
            params: &[I64],
            variadic: false,
        },
    ),
    (
        "freezestring",
        HelperSig {
            ret: I64,
            params: &[I64, I64],
            variadic: false,
        },
    ),
    // Introspection and instrumentation.
    (
        "defined",
        HelperSig {
            ret: I64,
            params: &[I64, I64, I64, I64],
            variadic: false,
        },
    ),
    (
        "checkmatch",
        HelperSig {
            ret: I64,
            params: &[I64, I64, I32],
            variadic: false,
        },
    ),
    (
        "checkkeyword",
        HelperSig {
            ret: I64,
            params: &[I64, I64, I64],
            variadic: false,
        },
    ),
    (
        "trace",
        HelperSig {
            ret: Ty::Void,
            params: &[I64, I64, I32],
            variadic: false,
        },
    ),
];

/// Resolve a helper by name, declaring it in the module on first use.
pub fn get_function(module: &mut Module, name: &str) -> Result<FuncId> {
    if let Some(id) = module.get_named_function(name) {
        return Ok(id);
    }
    let (_, sig) = HELPERS
        .iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| CompileError::UnknownHelper {
            name: name.to_string(),
        })?;
    tracing::trace!(helper = name, "declaring runtime helper");
    Ok(module.declare_function(
        name,
        FuncSig {
            ret: sig.ret,
            params: sig.params.to_vec(),
            variadic: sig.variadic,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_lookup_declares_once() {
        let mut module = Module::new("m");
        let a = get_function(&mut module, "opt_plus").unwrap();
        let b = get_function(&mut module, "opt_plus").unwrap();
        assert_eq!(a, b);
        assert_eq!(
            module
                .functions
                .iter()
                .filter(|f| f.name == "opt_plus")
                .count(),
            1
        );
    }

    #[test]
    fn test_unknown_helper_is_fatal() {
        let mut module = Module::new("m");
        assert!(matches!(
            get_function(&mut module, "no_such_helper"),
            Err(CompileError::UnknownHelper { name }) if name == "no_such_helper"
        ));
    }

    #[test]
    fn test_rb_funcall_is_variadic() {
        let mut module = Module::new("m");
        let id = get_function(&mut module, "rb_funcall").unwrap();
        let func = module.function(id).unwrap();
        assert!(func.sig.variadic);
        assert_eq!(func.sig.params, vec![I64, I64, I32]);
        assert!(func.is_declaration);
    }

    #[test]
    fn test_dispatch_helpers_share_shape() {
        let mut module = Module::new("m");
        for name in ["send", "opt_send_without_block", "invokesuper"] {
            let id = get_function(&mut module, name).unwrap();
            let func = module.function(id).unwrap();
            assert!(func.sig.variadic, "{name} takes trailing args");
            assert_eq!(func.sig.params.len(), 7, "{name} fixed params");
        }
    }

    #[test]
    fn test_every_table_entry_resolves() {
        let mut module = Module::new("m");
        for (name, _) in HELPERS {
            assert!(get_function(&mut module, name).is_ok(), "helper {name}");
        }
    }
}
