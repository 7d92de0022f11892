use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use catalog::TableSchema;
use values::{Collation, Row, SqlValue};
use vtab::{Cursor, Error, Result};

use crate::access::AccessPath;
use crate::tree;
use crate::{Key, KeyPart, LayerTrees};

/// A scan over one snapshot of a table's trees. The trees are cloned at
/// construction, so the cursor tolerates any mutation performed by its
/// own transaction while the scan is open.
pub struct MemoryCursor {
    schema: Arc<TableSchema>,
    trees: LayerTrees,
    feed: Feed,
}

enum Feed {
    /// Not yet filtered.
    Unarmed,
    /// A live snapshot iterator over the primary tree, one row ahead.
    Live {
        current: Option<Row>,
        range: tree::Range<Key, Row>,
    },
    /// A pre-collected region (constrained or secondary scans).
    Collected(VecDeque<Row>),
}

/// The key-part templates of the tree being scanned.
struct PartTemplate {
    column: usize,
    descending: bool,
    collation: Collation,
}

impl MemoryCursor {
    pub fn new(schema: Arc<TableSchema>, trees: LayerTrees) -> Self {
        MemoryCursor {
            schema,
            trees,
            feed: Feed::Unarmed,
        }
    }

    fn part_templates(&self, path: &AccessPath) -> Result<Vec<PartTemplate>> {
        match &path.index {
            None => Ok(self
                .schema
                .primary_key
                .iter()
                .map(|part| PartTemplate {
                    column: part.column,
                    descending: part.descending,
                    collation: part.collation,
                })
                .collect()),
            Some(name) => {
                let index = self
                    .schema
                    .index(name)
                    .ok_or_else(|| Error::NotFound(format!("index {name}")))?;
                Ok(index
                    .parts
                    .iter()
                    .map(|part| PartTemplate {
                        column: part.column,
                        descending: part.descending,
                        collation: part.collation,
                    })
                    .collect())
            }
        }
    }

    /// Fold one filter argument into key space: apply the target column's
    /// affinity, then the part's collation and direction.
    fn key_part(&self, template: &PartTemplate, value: &SqlValue) -> KeyPart {
        let coerced = self.schema.columns[template.column]
            .affinity
            .apply(value.clone());
        KeyPart::new(coerced, template.descending, template.collation)
    }

    fn collect_region(
        &self,
        path: &AccessPath,
        args: &[SqlValue],
    ) -> Result<VecDeque<Row>> {
        let templates = self.part_templates(path)?;
        if path.arg_count() > args.len() {
            return Err(Error::Misuse(format!(
                "filter expected {} args, got {}",
                path.arg_count(),
                args.len()
            )));
        }

        // An equality or range probe against NULL matches nothing.
        if args[..path.arg_count()].iter().any(SqlValue::is_null) {
            return Ok(VecDeque::new());
        }

        let eq_prefix: Vec<KeyPart> = args[..path.eq_parts]
            .iter()
            .zip(&templates)
            .map(|(value, template)| self.key_part(template, value))
            .collect();

        let mut next_arg = path.eq_parts;
        let bound_template = templates.get(path.eq_parts);
        if (path.lower.is_some() || path.upper.is_some()) && bound_template.is_none() {
            return Err(Error::Misuse("range bound beyond the key width".into()));
        }
        let mut take_bound = |strict: bool| {
            let part = self.key_part(bound_template.unwrap(), &args[next_arg]);
            next_arg += 1;
            (part, strict)
        };
        let lower = path.lower.map(|bound| take_bound(bound.strict));
        let upper = path.upper.map(|bound| take_bound(bound.strict));

        // Seed the tree range at the region start; precise strictness and
        // the region end are enforced per entry below.
        let mut start_key: Key = eq_prefix.clone();
        if let Some((part, _)) = &lower {
            start_key.push(part.clone());
        }
        let start = if start_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(start_key)
        };

        let mut rows = VecDeque::new();
        let within = |key: &Key| -> RegionCheck {
            if key.len() < eq_prefix.len() {
                return RegionCheck::Stop;
            }
            for (at, part) in eq_prefix.iter().enumerate() {
                if &key[at] != part {
                    return RegionCheck::Stop;
                }
            }
            if let Some(component) = key.get(eq_prefix.len()) {
                if let Some((part, strict)) = &lower {
                    if *strict && component == part {
                        return RegionCheck::Skip;
                    }
                }
                if let Some((part, strict)) = &upper {
                    if component > part || (*strict && component == part) {
                        return RegionCheck::Stop;
                    }
                }
            }
            RegionCheck::Keep
        };

        match &path.index {
            None => {
                for (key, row) in self.trees.primary.range((start, Bound::Unbounded)) {
                    match within(&key) {
                        RegionCheck::Keep => rows.push_back(row),
                        RegionCheck::Skip => continue,
                        RegionCheck::Stop => break,
                    }
                }
            }
            Some(name) => {
                let tree = self
                    .trees
                    .indexes
                    .get(name)
                    .ok_or_else(|| Error::NotFound(format!("index {name}")))?;
                for (key, entry) in tree.range((start, Bound::Unbounded)) {
                    match within(&key) {
                        RegionCheck::Keep => {}
                        RegionCheck::Skip => continue,
                        RegionCheck::Stop => break,
                    }
                    for primary in &entry.primary_keys {
                        let row = self.trees.primary.get(primary).cloned().ok_or_else(|| {
                            Error::Internal(format!(
                                "index {name} references a missing primary key"
                            ))
                        })?;
                        rows.push_back(row);
                    }
                }
            }
        }

        if path.descending {
            rows = rows.into_iter().rev().collect();
        }
        Ok(rows)
    }
}

enum RegionCheck {
    Keep,
    Skip,
    Stop,
}

#[async_trait::async_trait]
impl Cursor for MemoryCursor {
    async fn filter(
        &mut self,
        index_number: i32,
        index_string: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()> {
        let path = AccessPath::decode(index_number, index_string);

        if path.point {
            // Full-key equality against the primary tree.
            let templates = self.part_templates(&path)?;
            if args.len() < templates.len() {
                return Err(Error::Misuse(format!(
                    "point lookup expected {} args, got {}",
                    templates.len(),
                    args.len()
                )));
            }
            if args[..templates.len()].iter().any(SqlValue::is_null) {
                self.feed = Feed::Collected(VecDeque::new());
                return Ok(());
            }
            let key: Key = args
                .iter()
                .zip(&templates)
                .map(|(value, template)| self.key_part(template, value))
                .collect();
            let mut rows = VecDeque::new();
            if let Some(row) = self.trees.primary.get(&key) {
                rows.push_back(row.clone());
            }
            self.feed = Feed::Collected(rows);
            return Ok(());
        }

        let unconstrained =
            path.index.is_none() && path.eq_parts == 0 && path.lower.is_none() && path.upper.is_none();
        if unconstrained {
            let mut range = if path.descending {
                self.trees.primary.range_rev((Bound::Unbounded, Bound::Unbounded))
            } else {
                self.trees.primary.range((Bound::Unbounded, Bound::Unbounded))
            };
            let current = range.next().map(|(_, row)| row);
            self.feed = Feed::Live { current, range };
            return Ok(());
        }

        let rows = self.collect_region(&path, args)?;
        self.feed = Feed::Collected(rows);
        Ok(())
    }

    async fn next(&mut self) -> Result<()> {
        match &mut self.feed {
            Feed::Unarmed => Err(Error::Misuse("cursor advanced before filter".into())),
            Feed::Collected(rows) => {
                rows.pop_front();
                Ok(())
            }
            Feed::Live { current, range } => {
                *current = range.next().map(|(_, row)| row);
                Ok(())
            }
        }
    }

    fn eof(&self) -> bool {
        match &self.feed {
            Feed::Unarmed => true,
            Feed::Collected(rows) => rows.is_empty(),
            Feed::Live { current, .. } => current.is_none(),
        }
    }

    fn row(&self) -> Result<Row> {
        match &self.feed {
            Feed::Unarmed => Err(Error::Misuse("cursor read before filter".into())),
            Feed::Collected(rows) => rows
                .front()
                .cloned()
                .ok_or_else(|| Error::Misuse("cursor read at eof".into())),
            Feed::Live { current, .. } => current
                .clone()
                .ok_or_else(|| Error::Misuse("cursor read at eof".into())),
        }
    }
}
