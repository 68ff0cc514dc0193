//! Cross-shard join primitives.
//!
//! `ApplyJoin` runs the right side once per left row, feeding join-key
//! values through bind variables. `HashJoin` materializes the right side,
//! builds a hash index on the join key, and probes it with left rows.

use std::collections::HashMap;

use storm_common::prelude::*;

use crate::primitive::Primitive;
use crate::vcursor::VCursor;

/// Which side an output column comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinCol {
    Left(usize),
    Right(usize),
}

#[derive(Debug)]
pub struct ApplyJoin {
    pub left: Box<Primitive>,
    pub right: Box<Primitive>,
    /// Bind variables fed to the right side: (name, left column offset).
    pub vars: Vec<(String, usize)>,
    pub cols: Vec<JoinCol>,
    /// Left-outer: emit NULL-padded rows when the right side is empty.
    pub left_join: bool,
}

impl ApplyJoin {
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
        want_fields: bool,
    ) -> Result<QueryResult> {
        let left = self.left.execute(ctx, vcursor, bindvars, want_fields).await?;

        let mut out = QueryResult::default();
        let mut right_fields: Vec<Field> = Vec::new();
        for left_row in &left.rows {
            ctx.checked()?;
            let mut inner_bindvars = bindvars.clone();
            for (name, offset) in &self.vars {
                let value = left_row.get(*offset).cloned().ok_or_else(|| {
                    Error::internal(format!("join variable {} out of bounds", name))
                })?;
                inner_bindvars.insert(name.clone(), value);
            }
            let right = self
                .right
                .execute(ctx, vcursor, &inner_bindvars, want_fields)
                .await?;
            if right_fields.is_empty() {
                right_fields = right.fields.clone();
            }

            if right.rows.is_empty() {
                if self.left_join {
                    out.rows
                        .push(self.combine(left_row, None, right_fields.len()));
                }
                continue;
            }
            for right_row in &right.rows {
                out.rows
                    .push(self.combine(left_row, Some(right_row), right_fields.len()));
            }
        }

        out.fields = self.combine_fields(&left.fields, &right_fields);
        Ok(out)
    }

    fn combine(&self, left: &Row, right: Option<&Row>, _right_width: usize) -> Row {
        let values = self
            .cols
            .iter()
            .map(|col| match col {
                JoinCol::Left(i) => left.get(*i).cloned().unwrap_or(Value::Null),
                JoinCol::Right(i) => right
                    .and_then(|r| r.get(*i).cloned())
                    .unwrap_or(Value::Null),
            })
            .collect();
        Row::new(values)
    }

    fn combine_fields(&self, left: &[Field], right: &[Field]) -> Vec<Field> {
        self.cols
            .iter()
            .map(|col| match col {
                JoinCol::Left(i) => left
                    .get(*i)
                    .cloned()
                    .unwrap_or_else(|| Field::new("", "")),
                JoinCol::Right(i) => right
                    .get(*i)
                    .cloned()
                    .unwrap_or_else(|| Field::new("", "")),
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct HashJoin {
    pub left: Box<Primitive>,
    pub right: Box<Primitive>,
    pub left_key: usize,
    pub right_key: usize,
    pub cols: Vec<JoinCol>,
    pub left_join: bool,
}

impl HashJoin {
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
        want_fields: bool,
    ) -> Result<QueryResult> {
        // Build on the right, probe with the left.
        let right = self
            .right
            .execute(ctx, vcursor, bindvars, want_fields)
            .await?;
        let mut index: HashMap<String, Vec<&Row>> = HashMap::new();
        for row in &right.rows {
            if let Some(key) = row.get(self.right_key) {
                if key.is_null() {
                    continue;
                }
                index.entry(format!("{:?}", key)).or_default().push(row);
            }
        }

        let left = self.left.execute(ctx, vcursor, bindvars, want_fields).await?;
        let mut out = QueryResult::default();
        for left_row in &left.rows {
            let key = left_row.get(self.left_key);
            let matches = key
                .filter(|k| !k.is_null())
                .and_then(|k| index.get(&format!("{:?}", k)));
            match matches {
                Some(rows) => {
                    for right_row in rows {
                        out.rows.push(combine(&self.cols, left_row, Some(right_row)));
                    }
                }
                None if self.left_join => {
                    out.rows.push(combine(&self.cols, left_row, None));
                }
                None => {}
            }
        }

        out.fields = self
            .cols
            .iter()
            .map(|col| match col {
                JoinCol::Left(i) => left.fields.get(*i).cloned(),
                JoinCol::Right(i) => right.fields.get(*i).cloned(),
            })
            .map(|f| f.unwrap_or_else(|| Field::new("", "")))
            .collect();
        Ok(out)
    }
}

fn combine(cols: &[JoinCol], left: &Row, right: Option<&Row>) -> Row {
    Row::new(
        cols.iter()
            .map(|col| match col {
                JoinCol::Left(i) => left.get(*i).cloned().unwrap_or(Value::Null),
                JoinCol::Right(i) => right
                    .and_then(|r| r.get(*i).cloned())
                    .unwrap_or(Value::Null),
            })
            .collect(),
    )
}
