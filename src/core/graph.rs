use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use super::Tensor;

const OPERATION_COLOR: &str = "lightgrey";
const PARAMETER_COLOR: &str = "lightblue";
const OUTPUT_COLOR: &str = "darkolivegreen1";

fn format_shape(shape: &[usize]) -> String {
    let dimensions = shape
        .iter()
        .map(|dimension| dimension.to_string())
        .collect::<Vec<_>>();
    match dimensions.len() {
        1 => format!("({},)", dimensions[0]),
        _ => format!("({})", dimensions.join(", ")),
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

fn backward_node(tensor: &Tensor) -> String {
    format!("{}_backward", tensor.identifier())
}

/// Node standing for wherever gradient flowing out of `tensor` goes: its
/// backward operation if it has one, the tensor itself if it is a leaf.
fn gradient_sink(tensor: &Tensor) -> String {
    if tensor.is_leaf() {
        tensor.identifier().to_owned()
    } else {
        backward_node(tensor)
    }
}

/// Renders the graph behind `culmination` as Graphviz DOT: grey boxes for
/// backward operations, blue boxes for tracked leaves, and a green box for the
/// culmination itself. Edges point from producer to consumer. `names` maps
/// tensor identifiers to display labels; other leaves show their identifier.
pub fn render_dot(culmination: &Rc<Tensor>, names: &HashMap<String, String>) -> String {
    let mut lines = vec![
        "digraph {".to_owned(),
        "\tgraph [size=\"12,12\"]".to_owned(),
        "\tnode [align=left fontname=monospace fontsize=10 height=0.2 ranksep=0.1 shape=box style=filled]"
            .to_owned(),
    ];

    let leaf_label = |tensor: &Tensor| {
        let name = names
            .get(tensor.identifier())
            .map(String::as_str)
            .unwrap_or_else(|| tensor.identifier());
        format!("{}\\n{}", escape(name), format_shape(tensor.shape()))
    };

    lines.push(format!(
        "\t\"{}_output\" [label=\"{}\" fillcolor={}]",
        escape(culmination.identifier()),
        escape(&format_shape(culmination.shape())),
        OUTPUT_COLOR
    ));

    let mut visited = HashSet::new();
    let mut stack = vec![culmination.clone()];
    while let Some(tensor) = stack.pop() {
        if !visited.insert(Rc::as_ptr(&tensor)) {
            continue;
        }
        match tensor.gradient_function() {
            Some(name) => {
                lines.push(format!(
                    "\t\"{}\" [label=\"{}\" fillcolor={}]",
                    escape(&backward_node(&tensor)),
                    name,
                    OPERATION_COLOR
                ));
                for parent in tensor.parents() {
                    if !parent.requires_gradient() {
                        continue;
                    }
                    lines.push(format!(
                        "\t\"{}\" -> \"{}\"",
                        escape(&gradient_sink(parent)),
                        escape(&backward_node(&tensor))
                    ));
                    stack.push(parent.clone());
                }
            }
            None => {
                lines.push(format!(
                    "\t\"{}\" [label=\"{}\" fillcolor={}]",
                    escape(tensor.identifier()),
                    leaf_label(&tensor),
                    PARAMETER_COLOR
                ));
            }
        }
    }

    lines.push(format!(
        "\t\"{}\" -> \"{}_output\"",
        escape(&gradient_sink(culmination)),
        escape(culmination.identifier())
    ));
    lines.push("}".to_owned());
    lines.join("\n") + "\n"
}
