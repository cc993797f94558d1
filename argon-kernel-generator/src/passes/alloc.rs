use argon_ir::{Alloc, AllocKind, Group, Label, Let, Stmt, Var};

/// A scope-introducing node (`Alloc` or `Let`) detached from its body.
enum Scope {
    Alloc(Var, u32, AllocKind),
    Let(Var, argon_ir::Expr),
}

impl Scope {
    fn var(&self) -> &Var {
        match self {
            Scope::Alloc(var, ..) | Scope::Let(var, _) => var,
        }
    }

    fn wrap(self, body: Stmt) -> Stmt {
        match self {
            Scope::Alloc(buf, size, kind) => Stmt::alloc(buf, size, kind, body),
            Scope::Let(var, value) => Stmt::let_(var, value, body),
        }
    }

    fn split(stmt: Stmt) -> Result<(Scope, Stmt), Stmt> {
        match stmt {
            Stmt::Alloc(Alloc {
                buf,
                size,
                kind: AllocKind::Grf,
                body,
            }) => Ok((Scope::Alloc(buf, size, AllocKind::Grf), *body)),
            Stmt::Let(Let { var, value, body }) => Ok((Scope::Let(var, value), *body)),
            other => Err(other),
        }
    }

    /// Whether the scope's own definition refers to `var`.
    fn depends_on(&self, var: &Var) -> bool {
        match self {
            Scope::Alloc(..) => false,
            Scope::Let(_, value) => value.contains_var(var),
        }
    }
}

/// Narrows register allocations and `Let`s to the smallest run of
/// statements that uses them, and drops those that are never used.
/// Scopes are never moved into loops or conditionals.
pub fn optimize_alloc_let(stmt: Stmt) -> Stmt {
    stmt.map(&mut |s| match Scope::split(s) {
        Ok((scope, body)) => sink(scope, body),
        Err(other) => other,
    })
}

fn sink(scope: Scope, body: Stmt) -> Stmt {
    if !body.uses_var(scope.var()) {
        return body;
    }
    match body {
        Stmt::Group(Group {
            label: Label::None,
            body: items,
        }) => {
            let users: Vec<usize> = items
                .iter()
                .enumerate()
                .filter(|(_, s)| s.uses_var(scope.var()))
                .map(|(i, _)| i)
                .collect();
            let (first, last) = (users[0], users[users.len() - 1]);
            if first == 0 && last == items.len() - 1 {
                return scope.wrap(Stmt::Group(Group {
                    label: Label::None,
                    body: items,
                }));
            }
            let mut items = items;
            let tail = items.split_off(last + 1);
            let inner = items.split_off(first);
            let inner = match inner.len() {
                1 => inner.into_iter().next().map_or_else(Stmt::empty, |s| sink(scope, s)),
                _ => scope.wrap(Stmt::Group(Group {
                    label: Label::None,
                    body: inner,
                })),
            };
            items.push(inner);
            items.extend(tail);
            Stmt::Group(Group {
                label: Label::None,
                body: items,
            })
        }
        // Move below an independent inner scope so the narrowing can
        // continue inside it.
        body => match Scope::split(body) {
            Ok((inner, inner_body)) if !inner.depends_on(scope.var()) => {
                inner.wrap(sink(scope, inner_body))
            }
            Ok((inner, inner_body)) => scope.wrap(inner.wrap(inner_body)),
            Err(body) => scope.wrap(body),
        },
    }
}
