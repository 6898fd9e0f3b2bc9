//! Built-in object classes.

use crate::atom::Atom;
use crate::model::{
    ClassFlag, Factory, Inlet, ModelError, Object, ObjectClass, ObjectFlag, ObjectShape, Outlet,
    Parameter, PinType, Size,
};

pub fn register_builtins(factory: &mut Factory) -> Result<(), ModelError> {
    factory.add(ObjectClass::new("newbox", newbox))?;
    factory.add(ObjectClass::new("errorbox", errorbox).with_flag(ClassFlag::Internal))?;
    factory.add(ObjectClass::new("+", operator).with_io_description(describe_operator))?;
    factory.add(ObjectClass::new("*", operator).with_io_description(describe_operator))?;
    factory.add(ObjectClass::new("+~", signal_operator).with_io_description(describe_operator))?;
    factory.add(ObjectClass::new("*~", signal_operator).with_io_description(describe_operator))?;
    factory.add(ObjectClass::new("sig~", sig))?;
    factory.add(ObjectClass::new("osc~", osc).with_io_description(describe_osc))?;
    factory.add(ObjectClass::new("dac~", dac).with_io_description(describe_dac))?;
    factory.add(ObjectClass::new("print", print))?;
    factory.add(ObjectClass::new("receive", receive).with_alias("r"))?;
    factory.add(
        ObjectClass::new("message", message)
            .with_flag(ClassFlag::Internal)
            .with_flag(ClassFlag::DefinedSize)
            .with_attribute("text", Parameter::string(""))
            .with_io_description(describe_message),
    )?;
    factory.add(ObjectClass::new("delaysimple~", delay_simple))?;
    factory.add(ObjectClass::new("random", random))?;
    factory.add(ObjectClass::new("metro", metro).with_io_description(describe_metro))?;
    Ok(())
}

fn invalid(class: &str, reason: &str) -> ModelError {
    ModelError::InvalidArguments {
        class: class.to_string(),
        reason: reason.to_string(),
    }
}

fn has_number_argument(args: &[Atom]) -> bool {
    args.first().is_some_and(Atom::is_number)
}

fn signal_or_control() -> Inlet {
    Inlet::new([PinType::Signal, PinType::Control])
}

fn newbox(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
    Ok(ObjectShape::new(vec![Inlet::control()], vec![]))
}

fn errorbox(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
    Ok(ObjectShape::new(vec![], vec![]))
}

/// Right operand inlet only when no constant is given.
fn operator(args: &[Atom]) -> Result<ObjectShape, ModelError> {
    let mut inlets = vec![Inlet::control()];
    if !has_number_argument(args) {
        inlets.push(Inlet::control());
    }
    Ok(ObjectShape::new(inlets, vec![Outlet::control()]))
}

fn signal_operator(args: &[Atom]) -> Result<ObjectShape, ModelError> {
    let mut inlets = vec![Inlet::signal()];
    if !has_number_argument(args) {
        inlets.push(signal_or_control());
    }
    Ok(ObjectShape::new(inlets, vec![Outlet::signal()]))
}

fn describe_operator(object: &Object, is_inlet: bool, index: usize) -> String {
    let prefix = if object.name.ends_with('~') { "(signal) " } else { "" };
    match (is_inlet, index) {
        (true, 0) => format!("{prefix}Left operand"),
        (true, _) => format!("{prefix}Right operand"),
        (false, _) => format!("{prefix}Result"),
    }
}

fn sig(args: &[Atom]) -> Result<ObjectShape, ModelError> {
    let inlets = if has_number_argument(args) {
        vec![]
    } else {
        vec![Inlet::control()]
    };
    Ok(ObjectShape::new(inlets, vec![Outlet::signal()]))
}

fn osc(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
    let frequency = Inlet::new([PinType::Control, PinType::Signal]);
    let phase = Inlet::new([PinType::Control, PinType::Signal]);
    Ok(ObjectShape::new(vec![frequency, phase], vec![Outlet::signal()]))
}

fn describe_osc(_object: &Object, is_inlet: bool, index: usize) -> String {
    match (is_inlet, index) {
        (true, 0) => "(signal/float) Set frequency".to_string(),
        (true, _) => "(signal/float) Set phase".to_string(),
        (false, _) => "(signal) Output".to_string(),
    }
}

/// Output channels: integers, or `first:last` ranges. Defaults to `1 2`.
pub fn dac_routes(args: &[Atom]) -> Result<Vec<usize>, ModelError> {
    if args.is_empty() {
        return Ok(vec![1, 2]);
    }

    let mut routes = Vec::new();
    for arg in args {
        if arg.is_number() {
            let channel = arg.as_int();
            if channel <= 0 {
                return Err(invalid("dac~", "null or negative channel"));
            }
            routes.push(channel as usize);
        } else if let Some((first, last)) = arg.as_str().and_then(parse_range) {
            if first <= last {
                routes.extend(first..=last);
            } else {
                routes.extend((last..=first).rev());
            }
        } else {
            return Err(invalid("dac~", "wrong symbol syntax"));
        }
    }
    Ok(routes)
}

fn parse_range(text: &str) -> Option<(usize, usize)> {
    let (first, last) = text.split_once(':')?;
    let first: usize = first.parse().ok()?;
    let last: usize = last.parse().ok()?;
    (first > 0 && last > 0).then_some((first, last))
}

fn dac(args: &[Atom]) -> Result<ObjectShape, ModelError> {
    let routes = dac_routes(args)?;
    let inlets = (0..routes.len())
        .map(|i| if i == 0 { signal_or_control() } else { Inlet::signal() })
        .collect();
    Ok(ObjectShape::new(inlets, vec![]))
}

fn describe_dac(object: &Object, is_inlet: bool, index: usize) -> String {
    let channel = dac_routes(&object.arguments())
        .ok()
        .and_then(|routes| routes.get(index).copied());
    match (is_inlet, channel) {
        (true, Some(channel)) if index == 0 => {
            format!("Start/Stop dsp, (signal) Audio Out Channel {channel}")
        }
        (true, Some(channel)) => format!("(signal) Audio Out Channel {channel}"),
        _ => String::new(),
    }
}

fn print(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
    Ok(ObjectShape::new(vec![Inlet::control()], vec![]))
}

fn receive(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
    Ok(ObjectShape::new(vec![], vec![Outlet::control()]))
}

fn message(args: &[Atom]) -> Result<ObjectShape, ModelError> {
    if !args.is_empty() {
        return Err(invalid("message", "message too many arguments"));
    }
    Ok(
        ObjectShape::new(vec![Inlet::control()], vec![Outlet::control()])
            .with_size(Size::new(40.0, 20.0))
            .with_min_size(Size::new(20.0, 20.0))
            .with_flag(ObjectFlag::ResizeWidth),
    )
}

fn describe_message(_object: &Object, is_inlet: bool, _index: usize) -> String {
    if is_inlet {
        "Trigger the message".to_string()
    } else {
        "Message result".to_string()
    }
}

fn delay_simple(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
    Ok(ObjectShape::new(
        vec![signal_or_control(), signal_or_control(), Inlet::control()],
        vec![Outlet::signal()],
    ))
}

/// The range inlet only exists when the range is not given as an argument.
fn random(args: &[Atom]) -> Result<ObjectShape, ModelError> {
    let inlets = if args.first().is_some_and(Atom::is_number) {
        vec![Inlet::control()]
    } else {
        vec![Inlet::control(), Inlet::control()]
    };
    Ok(ObjectShape::new(inlets, vec![Outlet::control()]))
}

fn metro(_args: &[Atom]) -> Result<ObjectShape, ModelError> {
    Ok(ObjectShape::new(
        vec![Inlet::control(), Inlet::control()],
        vec![Outlet::control()],
    ))
}

fn describe_metro(_object: &Object, is_inlet: bool, index: usize) -> String {
    match (is_inlet, index) {
        (true, 0) => "Start/Stop metronome".to_string(),
        (true, _) => "Set time interval".to_string(),
        (false, _) => "Outputs metronome ticks as bang".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> Factory {
        Factory::with_builtin_classes()
    }

    #[test]
    fn test_operator_pins() {
        let factory = factory();
        let plus = factory.create_from_text("+ 42").unwrap();
        assert_eq!(plus.inlets().len(), 1);
        assert_eq!(plus.text(), "+ 42");
        assert_eq!(plus.size(), Object::DEFAULT_SIZE);

        let times = factory.create_from_text("*").unwrap();
        assert_eq!(times.inlets().len(), 2);
    }

    #[test]
    fn test_signal_operator_pins() {
        let factory = factory();
        let plus = factory.create_from_text("+~").unwrap();
        assert_eq!(plus.inlets().len(), 2);
        assert!(plus.inlets()[1].accepts(PinType::Control));
        assert!(plus.inlets()[1].accepts(PinType::Signal));
        assert_eq!(plus.outlets()[0].pin_type(), PinType::Signal);
    }

    #[test]
    fn test_random_range_inlet() {
        let factory = factory();
        let bare = factory.create_from_text("random").unwrap();
        assert_eq!(bare.inlets().len(), 2);
        assert_eq!(bare.outlets().len(), 1);

        let ranged = factory.create_from_text("random 10").unwrap();
        assert_eq!(ranged.inlets().len(), 1);
        assert_eq!(ranged.outlets().len(), 1);

        let named = factory.create_from_text("random foo").unwrap();
        assert_eq!(named.inlets().len(), 2);
    }

    #[test]
    fn test_dac_routes() {
        let atoms = crate::atom::parse("1 3:5 8", crate::atom::ParsingFlags::ALL);
        assert_eq!(dac_routes(&atoms).unwrap(), vec![1, 3, 4, 5, 8]);
        assert_eq!(dac_routes(&[]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_dac_rejects_bad_channels() {
        let factory = factory();
        assert_eq!(
            factory.create_from_text("dac~ 0").unwrap_err(),
            invalid("dac~", "null or negative channel")
        );
        assert_eq!(
            factory.create_from_text("dac~ 1:x").unwrap_err(),
            invalid("dac~", "wrong symbol syntax")
        );
    }

    #[test]
    fn test_dac_io_description() {
        let factory = factory();
        let dac = factory.create_from_text("dac~ 3 4").unwrap();
        assert_eq!(dac.inlets().len(), 2);
        assert_eq!(
            factory.io_description(&dac, true, 0),
            "Start/Stop dsp, (signal) Audio Out Channel 3"
        );
        assert_eq!(
            factory.io_description(&dac, true, 1),
            "(signal) Audio Out Channel 4"
        );
    }

    #[test]
    fn test_message_class() {
        let factory = factory();
        assert_eq!(
            factory.create_from_text("message 1").unwrap_err(),
            invalid("message", "message too many arguments")
        );

        let message = factory.create_from_text("message").unwrap();
        assert_eq!(message.size(), Size::new(40.0, 20.0));
        assert!(message.has_flag(ObjectFlag::DefinedSize));
        assert_eq!(message.attribute("text"), Some(&Parameter::string("")));
        assert_eq!(factory.io_description(&message, false, 0), "Message result");
    }

    #[test]
    fn test_receive_alias_and_listing() {
        let factory = factory();
        let receive = factory.create_from_text("r foo").unwrap();
        assert_eq!(receive.name(), "receive");

        let public = factory.names(true, true);
        assert!(public.contains(&"receive".to_string()));
        assert!(!public.contains(&"r".to_string()));
        assert!(!public.contains(&"message".to_string()));
    }

    #[test]
    fn test_empty_text_is_newbox() {
        let newbox = factory().create_from_text("").unwrap();
        assert_eq!(newbox.name(), "newbox");
        assert_eq!(newbox.text(), "");
    }
}
