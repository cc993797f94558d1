use crate::config::ExecConfig;
use ahash::AHashMap;
use argon_ir::{Expr, Type, Var};
use indexmap::IndexMap;

/// State shared by the builders and passes of one kernel attempt:
/// the execution target, unique temporary names and values bound
/// outside the generated body (kernel-level scalars).
#[derive(Debug)]
pub struct IrContext {
    exec: ExecConfig,
    name_counts: AHashMap<String, usize>,
    external_vars: IndexMap<Var, Expr, ahash::RandomState>,
}

impl IrContext {
    pub fn new(exec: ExecConfig) -> Self {
        Self {
            exec,
            name_counts: AHashMap::new(),
            external_vars: IndexMap::default(),
        }
    }

    pub fn exec(&self) -> &ExecConfig {
        &self.exec
    }

    /// Creates a variable whose name is unique within this context:
    /// `prefix`, then `prefix_1`, `prefix_2` and so on.
    pub fn create_tmp_var(&mut self, ty: Type, prefix: &str) -> Var {
        let count = self.name_counts.entry(prefix.to_owned()).or_insert(0);
        let name = if *count == 0 {
            prefix.to_owned()
        } else {
            format!("{prefix}_{count}")
        };
        *count += 1;
        Var::new(name, ty)
    }

    /// Registers a kernel-level value, returning the variable standing
    /// for it inside the body.
    pub fn external_var(&mut self, prefix: &str, value: Expr) -> Var {
        if let Some((var, _)) = self.external_vars.iter().find(|(_, v)| **v == value) {
            return var.clone();
        }
        let var = self.create_tmp_var(value.ty(), prefix);
        self.external_vars.insert(var.clone(), value);
        var
    }

    pub fn external_vars(&self) -> impl Iterator<Item = (&Var, &Expr)> {
        self.external_vars.iter()
    }
}
