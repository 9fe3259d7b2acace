use gradix::errors::Error;
use gradix::graph::{Graph, OpInfo, OpKind};
use gradix::storage::{Registry, Storage};
use gradix::{Layout, CPU_F32};

fn leaf(graph: &mut Graph, reg: &mut Registry, dims: &[usize], value: f32) -> gradix::NodeId {
    let mut s = Storage::init(reg, dims, CPU_F32).unwrap();
    s.fill(value).unwrap();
    let id = graph.add_leaf(reg, &s, true).unwrap();
    s.free(reg).unwrap();
    id
}

fn add_node(graph: &mut Graph, a: gradix::NodeId, b: gradix::NodeId) -> gradix::NodeId {
    let layout = graph.node(a).unwrap().layout().clone();
    graph
        .add_op(OpInfo::Axpy { alpha: 1.0 }, layout, &[a, b])
        .unwrap()
}

#[test]
fn leaf_is_materialized_eagerly() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2, 2], 1.0);
    let node = graph.node(a).unwrap();
    assert_eq!(node.kind(), OpKind::Leaf);
    assert!(node.storage().is_some());
    assert_eq!(node.ref_count(), 1);
}

#[test]
fn add_op_tracks_refcounts_and_requires_grad() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2, 2], 1.0);
    let b = leaf(&mut graph, &mut reg, &[2, 2], 2.0);
    graph.set_requires_grad(a, false).unwrap();
    graph.set_requires_grad(b, false).unwrap();
    let c = add_node(&mut graph, a, b);
    assert_eq!(graph.node(a).unwrap().ref_count(), 2);
    assert_eq!(graph.node(b).unwrap().ref_count(), 2);
    // OR of inputs, both false
    assert!(!graph.node(c).unwrap().requires_grad());
    assert_eq!(graph.node(c).unwrap().inputs(), &[a, b]);
}

#[test]
fn add_op_rejects_too_many_inputs() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2], 0.0);
    let layout = Layout::new(&[2]).unwrap();
    let result = graph.add_op(OpInfo::Axpy { alpha: 1.0 }, layout, &[a, a, a, a, a]);
    assert!(matches!(result, Err(Error::TooManyInputs { count: 5, .. })));
}

#[test]
fn topo_sort_orders_inputs_first() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2], 1.0);
    let b = leaf(&mut graph, &mut reg, &[2], 2.0);
    let c = add_node(&mut graph, a, b);
    let d = add_node(&mut graph, c, a);
    let order = graph.topo_sort(d).unwrap();
    let pos = |id| order.iter().position(|&x| x == id).unwrap();
    assert_eq!(order.len(), 4);
    assert!(pos(a) < pos(c));
    assert!(pos(b) < pos(c));
    assert!(pos(c) < pos(d));
}

#[test]
fn execute_caches_the_result_storage() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2, 2], 1.0);
    let b = leaf(&mut graph, &mut reg, &[2, 2], 2.0);
    let c = add_node(&mut graph, a, b);
    graph.execute(&mut reg, c).unwrap();
    let first = graph.node(c).unwrap().storage().unwrap().id();
    graph.execute(&mut reg, c).unwrap();
    let second = graph.node(c).unwrap().storage().unwrap().id();
    assert_eq!(first, second);
    assert_eq!(graph.node(c).unwrap().storage().unwrap().get(&[0, 0]).unwrap(), 3.0);
}

#[test]
fn execute_leaves_disconnected_subgraphs_alone() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a1 = leaf(&mut graph, &mut reg, &[2], 1.0);
    let b1 = leaf(&mut graph, &mut reg, &[2], 2.0);
    let c1 = add_node(&mut graph, a1, b1);
    let a2 = leaf(&mut graph, &mut reg, &[2], 3.0);
    let b2 = leaf(&mut graph, &mut reg, &[2], 4.0);
    let c2 = add_node(&mut graph, a2, b2);

    graph.execute(&mut reg, c1).unwrap();
    assert!(graph.node(c1).unwrap().storage().is_some());
    assert!(graph.node(c2).unwrap().storage().is_none());

    graph.execute(&mut reg, c2).unwrap();
    assert!(graph.node(c2).unwrap().storage().is_some());
}

#[test]
fn backward_requires_a_forward_value() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2], 1.0);
    let b = leaf(&mut graph, &mut reg, &[2], 2.0);
    let c = add_node(&mut graph, a, b);
    assert!(matches!(
        graph.backward(&mut reg, c),
        Err(Error::ForwardNotExecuted)
    ));
}

#[test]
fn freeing_a_node_releases_the_subgraph() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2], 1.0);
    let b = leaf(&mut graph, &mut reg, &[2], 2.0);
    let c = add_node(&mut graph, a, b);
    graph.execute(&mut reg, c).unwrap();
    assert_eq!(graph.len(), 3);

    // drop the user handles on the leaves first; the op keeps them alive
    graph.decrement_ref(&mut reg, a).unwrap();
    graph.decrement_ref(&mut reg, b).unwrap();
    assert_eq!(graph.len(), 3);

    graph.decrement_ref(&mut reg, c).unwrap();
    assert_eq!(graph.len(), 0);
    assert_eq!(reg.live_count(), 0);
}

#[test]
fn dot_dump_lists_nodes_and_slot_edges() {
    let mut graph = Graph::new();
    let mut reg = Registry::new();
    let a = leaf(&mut graph, &mut reg, &[2, 2], 1.0);
    let b = leaf(&mut graph, &mut reg, &[2, 2], 2.0);
    let c = add_node(&mut graph, a, b);
    let dot = graph.to_dot();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("axpy"));
    assert!(dot.contains(&format!("n{} -> n{} [label=\"0\"]", a.0, c.0)));
    assert!(dot.contains(&format!("n{} -> n{} [label=\"1\"]", b.0, c.0)));
}
