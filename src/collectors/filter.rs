use regex::Regex;

const ROS_PATTERN: &str = ".*(?:--ros-arg|/opt/ros).*";

#[derive(Debug, Clone)]
pub struct ProcessFilter {
    identity: Regex,
    ros: Option<Regex>,
}

impl ProcessFilter {
    pub fn new(pattern: &str, only_ros: bool) -> Result<Self, regex::Error> {
        let identity = compile(pattern)?;
        let ros = if only_ros {
            Some(compile(ROS_PATTERN)?)
        } else {
            None
        };
        Ok(Self { identity, ros })
    }

    pub fn accepts(&self, command_line: &str) -> bool {
        if !self.identity.is_match(command_line) {
            return false;
        }
        match &self.ros {
            Some(ros) => ros.is_match(command_line),
            None => true,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let wrapped = if pattern.contains(".*") {
        pattern.to_string()
    } else {
        format!(".*{pattern}.*")
    };
    Regex::new(&format!("^(?:{wrapped})"))
}
