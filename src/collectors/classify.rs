const NODE_REMAP: &str = "__node:=";
const NS_REMAP: &str = "__ns:=";
const ROS_CLI: &str = "ros2";
const ROS_CLI_SUBCOMMAND_TOKENS: usize = 3;

pub fn classify<S: AsRef<str>>(executable: &str, args: &[S]) -> String {
    if let Some(label) = ros_node_label(executable, args) {
        return label;
    }
    if args.len() > 1 {
        return argument_label(executable, args);
    }
    executable.to_string()
}

fn ros_node_label<S: AsRef<str>>(executable: &str, args: &[S]) -> Option<String> {
    let mut node = None;
    let mut ns = None;
    for arg in args {
        let arg = arg.as_ref();
        if let Some(idx) = arg.find(NODE_REMAP) {
            node = Some(&arg[idx + NODE_REMAP.len()..]);
        }
        if let Some(idx) = arg.find(NS_REMAP) {
            ns = Some(&arg[idx + NS_REMAP.len()..]);
        }
    }
    if node.is_none() && ns.is_none() {
        return None;
    }

    let mut label = node
        .filter(|n| !n.is_empty())
        .unwrap_or(executable)
        .to_string();
    if let Some(ns) = ns.filter(|n| !n.is_empty()) {
        label.push_str(", ");
        label.push_str(ns);
    }
    Some(label)
}

fn argument_label<S: AsRef<str>>(executable: &str, args: &[S]) -> String {
    let is_operand = |a: &str| !a.is_empty() && !a.starts_with('-');

    let first = args[1].as_ref();
    let last = args[args.len() - 1].as_ref();
    let operand = if is_operand(first) {
        first
    } else if is_operand(last) {
        last
    } else {
        return executable.to_string();
    };

    let operand = basename(operand);
    if operand.is_empty() {
        return executable.to_string();
    }

    let mut label = format!("{executable} {operand}");
    if operand == ROS_CLI {
        let end = args.len().min(2 + ROS_CLI_SUBCOMMAND_TOKENS);
        for arg in args.get(2..end).unwrap_or_default() {
            label.push(' ');
            label.push_str(arg.as_ref());
        }
    }
    label
}

pub fn classify_command_line(command: &str) -> String {
    let command = command.trim();
    if command.is_empty() {
        return String::new();
    }
    // kernel thread, e.g. "[kworker/0:1-events]"
    if command.starts_with('[') {
        return command.to_string();
    }
    if command.contains("__node") || command.contains("__ns") {
        return component_container_label(command);
    }
    if command.contains("python") {
        return interpreter_label(command);
    }
    command
        .split_whitespace()
        .next()
        .map(basename)
        .unwrap_or_default()
        .to_string()
}

fn component_container_label(command: &str) -> String {
    let mut label = command
        .split_whitespace()
        .next()
        .map(basename)
        .unwrap_or_default()
        .to_string();

    if let Some(node) = remap_value(command, "__node") {
        label = node.to_string();
    }
    if let Some(ns) = remap_value(command, "__ns") {
        label.push_str(", ");
        label.push_str(ns);
    }
    label
}

fn remap_value<'a>(command: &'a str, key: &str) -> Option<&'a str> {
    let idx = command.find(key)?;
    let token = command[idx..].split_whitespace().next()?;
    token.rsplit('=').next()
}

fn interpreter_label(command: &str) -> String {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return String::new();
    };
    let interpreter = basename(first);
    if tokens.len() < 2 {
        return interpreter.to_string();
    }

    let script = if tokens[1].starts_with('-') {
        tokens[tokens.len() - 1]
    } else {
        tokens[1]
    };
    let script = basename(script);

    let mut label = format!("{interpreter} {script}");
    if script == ROS_CLI {
        let end = tokens.len().min(2 + ROS_CLI_SUBCOMMAND_TOKENS);
        for token in tokens.get(2..end).unwrap_or_default() {
            label.push(' ');
            label.push_str(token);
        }
    }
    label.trim_end().to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
