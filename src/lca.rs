//! Lowest common ancestor search over one or two perspective DAGs.
//!
//! Two frontiers walk a combined reverse-insertion-order stream. Because a
//! parent's insertion index is always smaller than its child's, a frontier
//! entry always lies ahead of the stream, so every entry is met exactly
//! once. A version seen by both walks is a common ancestor; ancestors of a
//! common ancestor are covered and can no longer be lowest.

use crate::error::Error;
use crate::item::{Item, Version};
use crate::tree::DagRead;
use anyhow::Result;
use std::collections::BTreeSet;

#[derive(Default)]
struct Walk {
    frontier: BTreeSet<Version>,
    ancestors: BTreeSet<Version>,
}

impl Walk {
    fn seed(item: &Item) -> Self {
        let mut walk = Self::default();
        match &item.header.version {
            // a virtual merge seeds the walk with its parents
            None => walk.frontier.extend(item.header.parents.iter().cloned()),
            Some(v) => {
                walk.frontier.insert(v.clone());
            }
        }
        walk
    }
}

/// Finds the lowest common ancestor versions of `x` and `y`. The items may
/// live on two different trees (their perspectives); versions of mirrored
/// nodes are equal across perspectives, parent structure need not be.
///
/// Returns the versions in discovery order; empty if the histories share no
/// ancestor.
pub fn find_lcas<X, Y>(x: &Item, dag_x: &X, y: &Item, dag_y: &Y) -> Result<Vec<Version>>
where
    X: DagRead + ?Sized,
    Y: DagRead + ?Sized,
{
    if x.header.id != y.header.id {
        return Err(Error::InvalidItem(format!(
            "lca of different ids {} and {}",
            x.header.id, y.header.id
        ))
        .into());
    }
    let same = dag_x.label() == dag_y.label();

    // one is a direct single-parent child of the other
    if same && !x.is_virtual() && !y.is_virtual() {
        let (xv, yv) = (x.version()?, y.version()?);
        if x.header.parents.len() == 1 && &x.header.parents[0] == yv {
            return Ok(vec![yv.clone()]);
        }
        if y.header.parents.len() == 1 && &y.header.parents[0] == xv {
            return Ok(vec![xv.clone()]);
        }
    }

    let id = &x.header.id;
    let mut wx = Walk::seed(x);
    let mut wy = Walk::seed(y);
    let mut covered: BTreeSet<Version> = BTreeSet::new();
    let mut cas: Vec<Version> = Vec::new();

    let mut stream_x = dag_x.iter_rev(id);
    let mut stream_y = dag_y.iter_rev(id);
    let mut from_x = true;

    loop {
        let finalize = if wx.frontier.is_subset(&wy.frontier) {
            Some(&wx.frontier)
        } else if wy.frontier.is_subset(&wx.frontier) {
            Some(&wy.frontier)
        } else {
            None
        };
        if let Some(remaining) = finalize {
            for v in remaining {
                if !covered.contains(v) && !cas.contains(v) {
                    cas.push(v.clone());
                }
            }
            break;
        }

        // alternate between the two streams; one stream serves both walks
        // when the items share a perspective
        let (node, src_x) = if same {
            (stream_x.next(), true)
        } else if from_x {
            match stream_x.next() {
                Some(node) => (Some(node), true),
                None => (stream_y.next(), false),
            }
        } else {
            match stream_y.next() {
                Some(node) => (Some(node), false),
                None => (stream_x.next(), true),
            }
        };
        from_x = !from_x;
        let node = match node {
            Some(node) => node?,
            None => break,
        };
        let v = node.version()?.clone();

        let hit_x = (same || src_x) && wx.frontier.remove(&v);
        let hit_y = (same || !src_x) && wy.frontier.remove(&v);
        if !hit_x && !hit_y {
            continue;
        }
        if hit_x {
            wx.ancestors.insert(v.clone());
            wx.frontier.extend(node.header.parents.iter().cloned());
        }
        if hit_y {
            wy.ancestors.insert(v.clone());
            wy.frontier.extend(node.header.parents.iter().cloned());
        }
        if covered.contains(&v) || cas.contains(&v) {
            covered.extend(node.header.parents.iter().cloned());
            continue;
        }
        if wx.ancestors.contains(&v) && wy.ancestors.contains(&v) {
            cas.push(v.clone());
            // ancestors of a common ancestor are covered, in both trees
            covered.extend(node.header.parents.iter().cloned());
            if !same {
                let mirror = if hit_x {
                    dag_y.get_version(&v)?
                } else {
                    dag_x.get_version(&v)?
                };
                if let Some(mirror) = mirror {
                    covered.extend(mirror.header.parents.iter().cloned());
                }
            }
        }
    }

    cas.retain(|v| !covered.contains(v));
    lowest_only(cas, dag_x, dag_y)
}

/// Drops every common ancestor that has another common ancestor as a
/// descendant.
fn lowest_only<X, Y>(cas: Vec<Version>, dag_x: &X, dag_y: &Y) -> Result<Vec<Version>>
where
    X: DagRead + ?Sized,
    Y: DagRead + ?Sized,
{
    let mut lowest = Vec::new();
    'outer: for (n, ca) in cas.iter().enumerate() {
        for (m, other) in cas.iter().enumerate() {
            if n == m {
                continue;
            }
            let descends = dag_x.ancestor_of(ca, other)? || dag_y.ancestor_of(ca, other)?;
            if descends {
                continue 'outer;
            }
        }
        lowest.push(ca.clone());
    }
    Ok(lowest)
}
