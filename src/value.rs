use super::object::{
    GcObject, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative,
    ObjString, ObjectKind, RawObject,
};
use std::{cmp, fmt};

#[derive(Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Object(RawObject),
}

impl Value {
    /// Only nil and false are falsey.
    pub fn is_falsey(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::Bool(b) => !b,
            _ => false,
        }
    }

    pub fn kind(&self) -> Option<ObjectKind> {
        match self {
            Value::Object(object) => Some(unsafe { (**object).kind }),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn as_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            _ => unreachable!(),
        }
    }

    pub fn is_string(&self) -> bool {
        self.kind() == Some(ObjectKind::String)
    }

    pub fn is_class(&self) -> bool {
        self.kind() == Some(ObjectKind::Class)
    }

    pub fn is_instance(&self) -> bool {
        self.kind() == Some(ObjectKind::Instance)
    }

    pub fn as_object(&self) -> RawObject {
        match self {
            Value::Object(object) => *object,
            _ => unreachable!(),
        }
    }

    pub fn as_string(&self) -> *mut GcObject<ObjString> {
        self.as_object() as *mut GcObject<ObjString>
    }

    pub fn as_function(&self) -> *mut GcObject<ObjFunction> {
        self.as_object() as *mut GcObject<ObjFunction>
    }

    pub fn as_native(&self) -> *mut GcObject<ObjNative> {
        self.as_object() as *mut GcObject<ObjNative>
    }

    pub fn as_closure(&self) -> *mut GcObject<ObjClosure> {
        self.as_object() as *mut GcObject<ObjClosure>
    }

    pub fn as_class(&self) -> *mut GcObject<ObjClass> {
        self.as_object() as *mut GcObject<ObjClass>
    }

    pub fn as_instance(&self) -> *mut GcObject<ObjInstance> {
        self.as_object() as *mut GcObject<ObjInstance>
    }

    pub fn as_bound_method(&self) -> *mut GcObject<ObjBoundMethod> {
        self.as_object() as *mut GcObject<ObjBoundMethod>
    }
}

impl<T> From<*mut GcObject<T>> for Value {
    fn from(object: *mut GcObject<T>) -> Self {
        Value::Object(object as RawObject)
    }
}

impl cmp::PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // IEEE equality: NaN != NaN
            (Value::Number(a), Value::Number(b)) => a == b,
            // interning makes string equality an identity check too
            (Value::Object(a), Value::Object(b)) => std::ptr::eq(*a, *b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Object(object) => unsafe { write_object(f, *object) },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

unsafe fn write_function(f: &mut fmt::Formatter, function: *mut GcObject<ObjFunction>) -> fmt::Result {
    let name = (*function).data.name;
    if name.is_null() {
        write!(f, "<script>")
    } else {
        write!(f, "<fn {}>", (*name).data.chars)
    }
}

unsafe fn write_object(f: &mut fmt::Formatter, object: RawObject) -> fmt::Result {
    match (*object).kind {
        ObjectKind::String => {
            let string = object as *mut GcObject<ObjString>;
            write!(f, "{}", (*string).data.chars)
        }
        ObjectKind::Function => write_function(f, object as *mut GcObject<ObjFunction>),
        ObjectKind::Native => write!(f, "<native fn>"),
        ObjectKind::Upvalue => write!(f, "upvalue"),
        ObjectKind::Closure => {
            let closure = object as *mut GcObject<ObjClosure>;
            write_function(f, (*closure).data.function)
        }
        ObjectKind::Class => {
            let class = object as *mut GcObject<ObjClass>;
            write!(f, "{}", (*(*class).data.name).data.chars)
        }
        ObjectKind::Instance => {
            let instance = object as *mut GcObject<ObjInstance>;
            write!(f, "{} instance", (*(*(*instance).data.class).data.name).data.chars)
        }
        ObjectKind::BoundMethod => {
            let bound = object as *mut GcObject<ObjBoundMethod>;
            write_function(f, (*(*bound).data.method).data.function)
        }
    }
}

/// Runtime number rendering, `printf("%.15g")` style.
pub fn format_number(value: f64) -> String {
    format_g(value, 15)
}

/// `printf("%.*g")` emulation: `precision` significant digits, trailing
/// zeros trimmed, scientific notation outside [1e-4, 10^precision).
pub fn format_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let exponent: i32 = {
        let scientific = format!("{:e}", value);
        scientific
            .split('e')
            .nth(1)
            .and_then(|e| e.parse().ok())
            .unwrap_or(0)
    };
    if exponent < -4 || exponent >= precision as i32 {
        let formatted = format!("{:.*e}", precision - 1, value);
        let mut parts = formatted.splitn(2, 'e');
        let mantissa = parts
            .next()
            .unwrap_or("0")
            .trim_end_matches('0')
            .trim_end_matches('.');
        let e: i32 = parts.next().and_then(|e| e.parse().ok()).unwrap_or(0);
        let sign = if e < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, e.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let formatted = format!("{:.*}", decimals, value);
        if formatted.contains('.') {
            formatted
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string()
        } else {
            formatted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_print_bare() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.0), "0");
    }

    #[test]
    fn fractions_trim_trailing_zeros() {
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(123.456), "123.456");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
    }

    #[test]
    fn large_magnitudes_go_scientific() {
        assert_eq!(format_number(1e20), "1e+20");
        assert_eq!(format_number(1.5e20), "1.5e+20");
        assert_eq!(format_number(1e-7), "1e-07");
    }

    #[test]
    fn nine_digit_literal_format() {
        assert_eq!(format_g(123.456, 9), "123.456");
        assert_eq!(format_g(0.000125, 9), "0.000125");
    }

    #[test]
    fn non_finite() {
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_number(f64::NAN), "nan");
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert!(nan != nan);
        assert!(Value::Number(1.0) == Value::Number(1.0));
        assert!(Value::Nil == Value::Nil);
        assert!(Value::Nil != Value::Bool(false));
    }

    #[test]
    fn falseyness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }
}
